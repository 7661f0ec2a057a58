//! File-backed stream container.
//!
//! Grounded in `original_source/src/streams/filestream.cpp`: a writer
//! appends length-delimited `(StreamPacket, DataPacket)` pairs after an
//! `"FTLF"` magic + version byte + optional 64-byte index header; a reader
//! paces replay against wall-clock time, synthesising end-frame packets and
//! looping a "static" (single-timestamp) recording.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use ftl_protocol::{Channel, Codec, DataPacket, ErrorKind, FrameID, IndexHeader, ProtocolError, StreamPacket};

use crate::handle::Handle;
use crate::stream::{PacketCallback, Request, Stream, StreamProperty, StreamState, StreamType};

pub const MAGIC: &[u8; 4] = b"FTLF";
pub const CURRENT_VERSION: u8 = 5;

/// A frame is considered "static" (a looping still, rather than video) when
/// the recording contains this many or fewer distinct timestamps.
const STATIC_FILE_TIMESTAMP_THRESHOLD: usize = 9;

/// Default `kSpeed` playback multiplier, matching the original's `speed_ = 1`.
const DEFAULT_SPEED: i64 = 1;

fn write_record(w: &mut impl Write, sp: &StreamPacket, dp: &DataPacket) -> std::io::Result<()> {
    let sp_bytes = bincode::serialize(sp).expect("StreamPacket always serializes");
    let dp_bytes = bincode::serialize(dp).expect("DataPacket always serializes");
    w.write_all(&(sp_bytes.len() as u32).to_le_bytes())?;
    w.write_all(&sp_bytes)?;
    w.write_all(&(dp_bytes.len() as u32).to_le_bytes())?;
    w.write_all(&dp_bytes)?;
    Ok(())
}

fn read_record(r: &mut impl Read) -> std::io::Result<Option<(StreamPacket, DataPacket)>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let sp_len = u32::from_le_bytes(len_buf) as usize;
    let mut sp_buf = vec![0u8; sp_len];
    r.read_exact(&mut sp_buf)?;
    let sp: StreamPacket = bincode::deserialize(&sp_buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    r.read_exact(&mut len_buf)?;
    let dp_len = u32::from_le_bytes(len_buf) as usize;
    let mut dp_buf = vec![0u8; dp_len];
    r.read_exact(&mut dp_buf)?;
    let dp: DataPacket = bincode::deserialize(&dp_buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    Ok(Some((sp, dp)))
}

fn validate_path(path: &Path) -> ftl_protocol::Result<()> {
    match path.extension() {
        None => Ok(()),
        Some(ext) if ext == "ftl" => Ok(()),
        Some(_) => Err(ProtocolError::new(ErrorKind::BadUri, format!("file stream path must end in .ftl or have no extension: {}", path.display()))),
    }
}

/// Per-`(frameset, frame_number)` bookkeeping the replay loop needs to
/// synthesise an end-frame packet for any frame the recording itself never
/// terminated with one.
#[derive(Debug, Default, Clone)]
struct ReplayFrameState {
    last_ts: i64,
    observed: u32,
    has_end_frame: bool,
}

struct ReaderState {
    records: Vec<(StreamPacket, DataPacket)>,
    distinct_timestamps: usize,
    looping: bool,
    framerate_hint: Option<f64>,
}

/// A stream backed by an on-disk FTLF container. Can act as a writer
/// (`post` appends) or a reader (`begin` spawns the pacing task), not both
/// at once.
pub struct FileStream {
    state: StreamState,
    path: PathBuf,
    writer: Mutex<Option<std::fs::File>>,
    reader: Mutex<Option<ReaderState>>,
    active: std::sync::atomic::AtomicBool,
    stop: Arc<Notify>,
    config: crate::FileConfig,
    self_weak: Mutex<Weak<FileStream>>,
    /// Live `kLooping` value; initialised from the reader's computed
    /// eligibility (`ReaderState::looping`) and settable thereafter, but
    /// only where `supports_property(Looping)` holds (non-static readers).
    looping_enabled: std::sync::atomic::AtomicBool,
    /// Live `kSpeed` playback multiplier.
    speed: AtomicI64,
}

impl FileStream {
    /// Open (or create) `path` for writing. Writes an `FTLF` header
    /// immediately if the file is new.
    pub fn create(path: impl Into<PathBuf>, config: crate::FileConfig) -> ftl_protocol::Result<Arc<Self>> {
        let path = path.into();
        validate_path(&path)?;
        let is_new = !path.exists();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ProtocolError::new(ErrorKind::BadUri, e.to_string()))?;
        if is_new {
            file.write_all(MAGIC).map_err(|e| ProtocolError::new(ErrorKind::BadUri, e.to_string()))?;
            file.write_all(&[CURRENT_VERSION]).map_err(|e| ProtocolError::new(ErrorKind::BadUri, e.to_string()))?;
            // Reserved index header (v >= 2): 8 x i64, first = -1.
            let mut index = [0u8; 64];
            index[0..8].copy_from_slice(&(-1i64).to_le_bytes());
            file.write_all(&index).map_err(|e| ProtocolError::new(ErrorKind::BadUri, e.to_string()))?;
        }
        Ok(Arc::new_cyclic(|weak| Self {
            state: StreamState::new(),
            path,
            writer: Mutex::new(Some(file)),
            reader: Mutex::new(None),
            active: std::sync::atomic::AtomicBool::new(true),
            stop: Arc::new(Notify::new()),
            config,
            self_weak: Mutex::new(weak.clone()),
            looping_enabled: std::sync::atomic::AtomicBool::new(false),
            speed: AtomicI64::new(DEFAULT_SPEED),
        }))
    }

    /// Open an existing FTLF file for replay.
    pub fn open(path: impl Into<PathBuf>, config: crate::FileConfig) -> ftl_protocol::Result<Arc<Self>> {
        let path = path.into();
        validate_path(&path)?;
        let mut file = std::fs::File::open(&path).map_err(|e| ProtocolError::new(ErrorKind::BadUri, e.to_string()))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic).map_err(|e| ProtocolError::new(ErrorKind::BadParse, e.to_string()))?;
        if &magic != MAGIC {
            return Err(ProtocolError::new(ErrorKind::BadParse, "not an FTLF file"));
        }
        let mut version = [0u8; 1];
        file.read_exact(&mut version).map_err(|e| ProtocolError::new(ErrorKind::BadParse, e.to_string()))?;
        let version = version[0];
        if version == 4 {
            // Decided (see DESIGN.md): reject rather than transparently
            // upgrade, matching the original's behaviour for this version.
            return Err(ProtocolError::new(ErrorKind::BadVersion, "version 4 FTLF files are not supported"));
        }
        if version > CURRENT_VERSION {
            return Err(ProtocolError::new(ErrorKind::BadVersion, format!("unsupported FTLF version {version}")));
        }
        if version >= 2 {
            let mut index = [0u8; 64];
            file.read_exact(&mut index).map_err(|e| ProtocolError::new(ErrorKind::BadParse, e.to_string()))?;
            let _ = IndexHeader { reserved: index };
        }

        let mut records = Vec::new();
        loop {
            match read_record(&mut file) {
                Ok(Some(rec)) => records.push(rec),
                Ok(None) => break,
                Err(e) => return Err(ProtocolError::new(ErrorKind::BadParse, e.to_string())),
            }
        }

        let distinct_timestamps = {
            let mut ts: Vec<i64> = records.iter().map(|(sp, _)| sp.timestamp).collect();
            ts.sort_unstable();
            ts.dedup();
            ts.len()
        };
        // A recording with few distinct timestamps is a "static" still, not
        // video - looping is disabled for it. A real (non-static) recording
        // loops once it has played through.
        let looping = distinct_timestamps > STATIC_FILE_TIMESTAMP_THRESHOLD;

        let framerate_hint = infer_framerate(&records);

        Ok(Arc::new_cyclic(|weak| Self {
            state: StreamState::new(),
            path,
            writer: Mutex::new(None),
            reader: Mutex::new(Some(ReaderState { records, distinct_timestamps, looping, framerate_hint })),
            active: std::sync::atomic::AtomicBool::new(false),
            stop: Arc::new(Notify::new()),
            config,
            self_weak: Mutex::new(weak.clone()),
            looping_enabled: std::sync::atomic::AtomicBool::new(looping),
            speed: AtomicI64::new(DEFAULT_SPEED),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Spawn the pacing task. Consumers observe delivered packets through
    /// `on_packet`, same as any other `Stream`.
    pub fn start_replay(self: &Arc<Self>) -> ftl_protocol::Result<()> {
        let this = self.clone();
        let stop = self.stop.clone();
        self.active.store(true, std::sync::atomic::Ordering::SeqCst);
        tokio::spawn(async move {
            this.replay_loop(stop).await;
        });
        Ok(())
    }

    async fn replay_loop(self: Arc<Self>, stop: Arc<Notify>) {
        loop {
            let records = {
                let reader = self.reader.lock();
                let Some(r) = reader.as_ref() else { return };
                r.records.clone()
            };
            if records.is_empty() {
                return;
            }

            let start_wall = Instant::now();
            let start_ts = records[0].0.timestamp;
            let mut frame_states: std::collections::HashMap<FrameID, ReplayFrameState> = std::collections::HashMap::new();

            for (sp, dp) in &records {
                if !self.active.load(Ordering::SeqCst) {
                    return;
                }
                let speed = self.speed.load(Ordering::SeqCst).max(1) as u64;
                let target = Duration::from_millis(((sp.timestamp - start_ts).max(0) as u64) / speed)
                    .saturating_sub(Duration::from_millis(self.config.lookahead_ms.max(0) as u64));
                let elapsed = start_wall.elapsed();
                if target > elapsed {
                    tokio::select! {
                        _ = tokio::time::sleep(target - elapsed) => {}
                        _ = stop.notified() => return,
                    }
                }

                let id = FrameID::new(sp.frameset_id(), sp.frame_number);
                let entry = frame_states.entry(id).or_default();
                entry.last_ts = sp.timestamp;
                entry.observed += 1;
                if sp.channel.is_end_frame() {
                    entry.has_end_frame = true;
                }

                self.state.dispatch_packet(*sp, dp.clone());
            }

            // One synthesised kEndFrame per frame that never received a real
            // one, carrying the total packet count (observed + the
            // synthesised packet itself) the way a real end-frame packet
            // would.
            for (id, st) in frame_states {
                if !st.has_end_frame {
                    let mut sp = StreamPacket::new(st.last_ts, 0, id.source, Channel::END_FRAME);
                    sp.frameset_id = id.frameset;
                    let mut dp = DataPacket::new(Codec::Raw, vec![]);
                    dp.frame_count = (st.observed + 1).min(u8::MAX as u32) as u8;
                    self.state.dispatch_packet(sp, dp);
                }
            }

            if !self.looping_enabled.load(Ordering::SeqCst) {
                self.active.store(false, Ordering::SeqCst);
                return;
            }
        }
    }

    pub fn distinct_timestamp_count(&self) -> Option<usize> {
        self.reader.lock().as_ref().map(|r| r.distinct_timestamps)
    }

    pub fn inferred_framerate(&self) -> Option<f64> {
        self.reader.lock().as_ref().and_then(|r| r.framerate_hint)
    }
}

/// Video framerate inferred from the smallest positive inter-packet
/// timestamp delta.
fn infer_framerate(records: &[(StreamPacket, DataPacket)]) -> Option<f64> {
    let mut min_delta: Option<i64> = None;
    let mut prev: Option<i64> = None;
    for (sp, _) in records {
        if let Some(p) = prev {
            let delta = sp.timestamp - p;
            if delta > 0 {
                min_delta = Some(min_delta.map_or(delta, |m| m.min(delta)));
            }
        }
        prev = Some(sp.timestamp);
    }
    min_delta.filter(|d| *d > 0).map(|d| 1000.0 / d as f64)
}

impl Stream for FileStream {
    fn post(&self, sp: StreamPacket, dp: DataPacket) -> ftl_protocol::Result<()> {
        if dp.data.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock();
        let Some(file) = writer.as_mut() else {
            return Err(ProtocolError::new(ErrorKind::BadUri, "file stream not opened for writing"));
        };
        write_record(file, &sp, &dp).map_err(|e| ProtocolError::new(ErrorKind::BadUri, e.to_string()))
    }

    fn begin(&self) -> ftl_protocol::Result<()> {
        if self.reader.lock().is_some() {
            if let Some(strong) = self.self_weak.lock().upgrade() {
                return strong.start_replay();
            }
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn end(&self) -> ftl_protocol::Result<()> {
        self.active.store(false, std::sync::atomic::Ordering::SeqCst);
        self.stop.notify_waiters();
        Ok(())
    }

    fn active(&self) -> bool {
        self.active.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn reset(&self) {
        self.state.clear();
    }

    fn refresh(&self, _req: Request) -> ftl_protocol::Result<()> {
        Ok(())
    }

    fn enable(&self, _id: FrameID, _channel: Channel) {}
    fn disable(&self, _id: FrameID, _channel: Channel) {}
    fn enabled(&self, _id: FrameID, _channel: Channel) -> bool {
        true
    }

    fn set_property(&self, prop: StreamProperty, value: i64) {
        match prop {
            StreamProperty::Looping if self.supports_property(StreamProperty::Looping) => {
                self.looping_enabled.store(value != 0, Ordering::SeqCst);
            }
            StreamProperty::Speed if self.supports_property(StreamProperty::Speed) => {
                self.speed.store(value.max(1), Ordering::SeqCst);
            }
            _ => {}
        }
    }

    fn get_property(&self, prop: StreamProperty) -> Option<i64> {
        match prop {
            StreamProperty::Looping if self.supports_property(StreamProperty::Looping) => {
                Some(self.looping_enabled.load(Ordering::SeqCst) as i64)
            }
            StreamProperty::Speed if self.supports_property(StreamProperty::Speed) => Some(self.speed.load(Ordering::SeqCst)),
            StreamProperty::FrameRate => self.inferred_framerate().map(|fr| fr.round() as i64),
            _ => None,
        }
    }

    fn supports_property(&self, prop: StreamProperty) -> bool {
        match prop {
            // kLooping is video-only: only a non-static reader supports it.
            StreamProperty::Looping => self.reader.lock().as_ref().is_some_and(|r| r.looping),
            StreamProperty::Speed => self.reader.lock().is_some(),
            StreamProperty::FrameRate => self.inferred_framerate().is_some(),
            StreamProperty::Uri => true,
            _ => false,
        }
    }

    fn property_uri(&self) -> Option<String> {
        Some(format!("file://{}", self.path.display()))
    }

    fn stream_type(&self) -> StreamType {
        StreamType::File
    }

    fn on_packet(&self, f: Box<dyn Fn(&PacketCallback) -> bool + Send + Sync>) -> Handle {
        self.state.on_packet(move |args| f(args))
    }
    fn on_request(&self, f: Box<dyn Fn(&Request) -> bool + Send + Sync>) -> Handle {
        self.state.on_request(move |args| f(args))
    }
    fn on_error(&self, f: Box<dyn Fn(&ProtocolError) -> bool + Send + Sync>) -> Handle {
        self.state.on_error(move |args| f(args))
    }

    fn state(&self) -> &StreamState {
        &self.state
    }
}
