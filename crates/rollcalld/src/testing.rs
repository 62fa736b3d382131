//! In-process fakes shared by the daemon's unit tests.

use rollcall_core::{Embedding, EmbeddingModel, FaceTensor, Identity, ModelError};
use rollcall_hw::{CameraError, FrameCallback, FrameLayout, FrameSource, RawFrame, StreamLost};
use rollcall_store::{LoadedRoster, RosterStore, StoreError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub fn identity(name: &str, values: &[f32]) -> Identity {
    Identity {
        name: name.into(),
        id: "7".into(),
        department: "CS".into(),
        section: "A".into(),
        embedding: Embedding::new(values.to_vec()),
    }
}

#[derive(Default)]
struct MemoryState {
    identities: Vec<Identity>,
    thumbnails: BTreeMap<String, Vec<u8>>,
    fail_saves: bool,
}

/// Roster store held in memory. Clones share state, so a test can keep a
/// handle after boxing one into a [`Roster`](crate::roster::Roster).
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Pre-populate persisted identities and thumbnails (one byte each).
    pub fn seed(&self, identities: &[Identity], thumbnails: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.identities = identities.to_vec();
        for name in thumbnails {
            state.thumbnails.insert(name.to_string(), name.as_bytes().to_vec());
        }
    }

    /// Make every `save_identities` call fail until reset.
    pub fn fail_saves(&self, fail: bool) {
        self.state.lock().unwrap().fail_saves = fail;
    }

    pub fn persisted(&self) -> Vec<Identity> {
        self.state.lock().unwrap().identities.clone()
    }

    pub fn thumbnail_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().thumbnails.keys().cloned().collect()
    }
}

impl RosterStore for MemoryStore {
    fn load_identities(&self) -> Result<LoadedRoster, StoreError> {
        Ok(LoadedRoster {
            identities: self.persisted(),
            skipped: Vec::new(),
        })
    }

    fn save_identities(&mut self, identities: &[Identity]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_saves {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        state.identities = identities.to_vec();
        Ok(())
    }

    fn load_thumbnail(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.state.lock().unwrap().thumbnails.get(name).cloned())
    }

    fn save_thumbnail(&mut self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap()
            .thumbnails
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete_thumbnail(&mut self, name: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().unwrap().thumbnails.remove(name).is_some())
    }

    fn thumbnail_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.thumbnail_keys())
    }
}

/// A 4x4 BGRA frame filled with one color.
pub fn bgra_frame(b: u8, g: u8, r: u8, sequence: u32) -> RawFrame {
    let layout = FrameLayout::from_fourcc(*b"BGR4", 4, 4, 16);
    RawFrame {
        data: [b, g, r, 255].repeat(16),
        layout,
        timestamp: Instant::now(),
        sequence,
    }
}

/// A frame whose pixel format cannot be decoded.
pub fn unsupported_frame() -> RawFrame {
    RawFrame {
        data: vec![0; 32],
        layout: FrameLayout::from_fourcc(*b"MJPG", 4, 4, 8),
        timestamp: Instant::now(),
        sequence: 0,
    }
}

/// Model that embeds the mean of each color channel of its input.
///
/// Optionally blocks every call on a gate until the test releases it, so
/// a test can hold the pipeline in `Processing`.
pub struct ChannelMeanModel {
    pub calls: Arc<AtomicUsize>,
    gate: Option<std::sync::mpsc::Receiver<()>>,
    fail: bool,
}

impl ChannelMeanModel {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            gate: None,
            fail: false,
        }
    }

    /// Each call waits for one message on the returned sender.
    pub fn gated() -> (Self, std::sync::mpsc::Sender<()>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut model = Self::new();
        model.gate = Some(rx);
        (model, tx)
    }

    pub fn failing() -> Self {
        let mut model = Self::new();
        model.fail = true;
        model
    }
}

impl EmbeddingModel for ChannelMeanModel {
    fn input_size(&self) -> u32 {
        8
    }

    fn output_len(&self) -> usize {
        3
    }

    fn infer(&mut self, tensor: &FaceTensor) -> Result<Embedding, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        if self.fail {
            return Err(ModelError::InferenceFailed("injected".into()));
        }
        let pixels = (tensor.size() * tensor.size()) as f32;
        let mut sums = [0.0f32; 3];
        for ((_, _, c), v) in tensor.0.indexed_iter() {
            sums[c] += v;
        }
        // Shift out of [-1, 1] so a black frame still has a nonzero norm.
        Ok(Embedding::new(sums.iter().map(|s| s / pixels + 2.0).collect()))
    }
}

/// Still-capture-only source that serves one fixed frame.
pub struct StillSource {
    frame: RawFrame,
    pub pictures: Arc<AtomicUsize>,
}

impl StillSource {
    pub fn new(frame: RawFrame) -> Self {
        Self {
            frame,
            pictures: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl FrameSource for StillSource {
    fn supports_streaming(&self) -> bool {
        false
    }

    fn start_streaming(
        &mut self,
        _on_frame: FrameCallback,
        _on_lost: StreamLost,
    ) -> Result<(), CameraError> {
        Err(CameraError::StreamingNotSupported)
    }

    fn stop_streaming(&mut self) {}

    fn take_picture(&mut self) -> Result<RawFrame, CameraError> {
        let n = self.pictures.fetch_add(1, Ordering::SeqCst);
        let mut frame = self.frame.clone();
        frame.sequence = n as u32;
        Ok(frame)
    }
}

/// Streaming source whose callbacks the test drives by hand.
#[derive(Clone, Default)]
pub struct PushSource {
    callback: Arc<Mutex<Option<FrameCallback>>>,
    lost: Arc<Mutex<Option<StreamLost>>>,
    refuse: bool,
    still: Option<RawFrame>,
    pub pictures: Arc<AtomicUsize>,
}

impl PushSource {
    /// A source that advertises streaming but fails to start it.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    /// Also serve `frame` for still captures.
    pub fn with_stills(mut self, frame: RawFrame) -> Self {
        self.still = Some(frame);
        self
    }

    /// Deliver `frame` as the capture thread would. Returns false if not streaming.
    pub fn push(&self, frame: RawFrame) -> bool {
        match self.callback.lock().unwrap().as_mut() {
            Some(cb) => {
                cb(frame);
                true
            }
            None => false,
        }
    }

    /// End the stream the way a failing device does. Returns false if not streaming.
    pub fn lose(&self, reason: &str) -> bool {
        self.callback.lock().unwrap().take();
        let lost = self.lost.lock().unwrap().take();
        match lost {
            Some(on_lost) => {
                on_lost(CameraError::CaptureFailed(reason.into()));
                true
            }
            None => false,
        }
    }
}

impl FrameSource for PushSource {
    fn supports_streaming(&self) -> bool {
        true
    }

    fn start_streaming(
        &mut self,
        on_frame: FrameCallback,
        on_lost: StreamLost,
    ) -> Result<(), CameraError> {
        if self.refuse {
            return Err(CameraError::CaptureFailed("no frame from stream".into()));
        }
        *self.callback.lock().unwrap() = Some(on_frame);
        *self.lost.lock().unwrap() = Some(on_lost);
        Ok(())
    }

    fn stop_streaming(&mut self) {
        self.callback.lock().unwrap().take();
        self.lost.lock().unwrap().take();
    }

    fn take_picture(&mut self) -> Result<RawFrame, CameraError> {
        let Some(frame) = &self.still else {
            return Err(CameraError::CaptureFailed("push-only".into()));
        };
        let n = self.pictures.fetch_add(1, Ordering::SeqCst);
        let mut frame = frame.clone();
        frame.sequence = n as u32;
        Ok(frame)
    }
}
