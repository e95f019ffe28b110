//! The recorder: lifecycle state machine, 20ms mix tick, segment rotation
//! and finalization.
//!
//! One mutex guards everything the tick touches (current segment, sender
//! buffers, scratch memory). Heavy I/O (segment preparation, renames, the
//! quota walk) happens outside it: prepare outside, swap inside, finalize
//! outside.

use std::collections::HashMap;
use std::fs::File;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use starling_media::encoder::{VoiceEncoder, MAX_PACKET_LEN};
use starling_media::mixer::{combine_rms, MixAccumulator, FRAME_BYTES, FRAME_SAMPLES, TICK_MS};
use starling_media::ogg::OggOpusWriter;
use starling_media::pcm::PcmQueue;
use starling_media::waveform::{sidecar_name, TickSample, WaveformSet, TSWF_HEADER_LEN};
use starling_store::{
    FinalizeUpdate, NewRecording, Participant, RecordingEntry, RecordingStore, WaveformInfo,
};

use crate::channel::{is_alone, ChannelDirectory, ClientId, Identity};
use crate::config::RecordingConfig;
use crate::events::{EventHub, Subscription, VoiceEvent};
use crate::quota;
use crate::segment::{self, SegmentPaths};

/// Segments are rotated once they have been open this long.
const SEGMENT_ROTATE_AFTER_MS: u64 = 60 * 60 * 1000;
/// Senders silent longer than this are dropped from the mix.
const SENDER_STALE_AFTER_MS: u64 = 30_000;
/// Muxer/waveform/index flush cadence.
const FLUSH_INTERVAL_MS: u64 = 1_000;
/// The tick-driven alone re-check is rate limited to this.
const ALONE_CHECK_INTERVAL_MS: u64 = 1_000;

pub const TICK_INTERVAL: Duration = Duration::from_millis(TICK_MS);

#[derive(Debug, Clone, serde::Serialize)]
pub struct RecorderStatus {
    pub enabled: bool,
    pub active: bool,
    pub current: Option<RecordingEntry>,
}

struct OpenSegment {
    start: chrono::DateTime<Utc>,
    started_ms: u64,
    dir_id: String,
    paths: SegmentPaths,
    entry_id: i64,
    writer: OggOpusWriter<File>,
    encoder: VoiceEncoder,
    waveforms: WaveformSet,
    participants: Vec<Participant>,
}

enum ControlState {
    Idle,
    Active(Box<OpenSegment>),
    PendingStop {
        segment: Box<OpenSegment>,
        reason: String,
        deadline_ms: u64,
    },
}

impl ControlState {
    fn segment_mut(&mut self) -> Option<&mut OpenSegment> {
        match self {
            ControlState::Idle => None,
            ControlState::Active(segment) => Some(segment),
            ControlState::PendingStop { segment, .. } => Some(segment),
        }
    }

    fn segment(&self) -> Option<&OpenSegment> {
        match self {
            ControlState::Idle => None,
            ControlState::Active(segment) => Some(segment),
            ControlState::PendingStop { segment, .. } => Some(segment),
        }
    }

    fn is_idle(&self) -> bool {
        matches!(self, ControlState::Idle)
    }
}

struct Inner {
    state: ControlState,
    buffers: HashMap<ClientId, PcmQueue>,
    accum: MixAccumulator,
    scratch: Vec<u8>,
    mixed: Vec<i16>,
    packet: Vec<u8>,
    alone: bool,
    last_alone_check_ms: u64,
    last_flush_ms: u64,
}

pub struct Recorder {
    bot_id: i64,
    root: std::path::PathBuf,
    store: Arc<RecordingStore>,
    directory: Arc<dyn ChannelDirectory>,
    cfg: Mutex<RecordingConfig>,
    enabled: AtomicBool,
    connected: AtomicBool,
    epoch: Instant,
    clock_skew_ms: AtomicU64,
    inner: Mutex<Inner>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Recorder {
    pub fn new(
        bot_id: i64,
        root: std::path::PathBuf,
        cfg: RecordingConfig,
        store: Arc<RecordingStore>,
        directory: Arc<dyn ChannelDirectory>,
    ) -> Arc<Self> {
        let alone = is_alone(&directory.channel_members(), &cfg.exclude_uids);
        let enabled = cfg.enabled;
        Arc::new(Self {
            bot_id,
            root,
            store,
            directory,
            cfg: Mutex::new(cfg),
            enabled: AtomicBool::new(enabled),
            connected: AtomicBool::new(false),
            epoch: Instant::now(),
            clock_skew_ms: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                state: ControlState::Idle,
                buffers: HashMap::new(),
                accum: MixAccumulator::new(),
                scratch: vec![0u8; FRAME_BYTES],
                mixed: vec![0i16; FRAME_SAMPLES],
                packet: vec![0u8; MAX_PACKET_LEN],
                alone,
                last_alone_check_ms: 0,
                last_flush_ms: 0,
            }),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Milliseconds on the recorder's monotonic epoch.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + self.clock_skew_ms.load(Ordering::Relaxed)
    }

    /// Warp the monotonic clock forward. Test hook only.
    #[doc(hidden)]
    pub fn advance_clock(&self, ms: u64) {
        self.clock_skew_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Register for channel events; the handles are kept until dispose.
    pub fn attach_hub(self: &Arc<Self>, hub: &EventHub) {
        let weak: Weak<Recorder> = Arc::downgrade(self);
        let subscription = hub.subscribe(move |event| {
            let Some(recorder) = weak.upgrade() else {
                return;
            };
            match event {
                VoiceEvent::BotConnected => recorder.on_bot_connected(),
                VoiceEvent::BotDisconnected => recorder.on_bot_disconnected(),
                VoiceEvent::AloneChanged(alone) => recorder.on_alone_changed(*alone),
                VoiceEvent::ParticipantsChanged => recorder.on_participants_changed(),
                VoiceEvent::EnabledChanged(enabled) => recorder.set_enabled(*enabled),
            }
        });
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .push(subscription);
    }

    /// Run the mix tick on a dedicated thread until dispose.
    pub fn spawn_ticker(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let recorder = self.clone();
        thread::Builder::new()
            .name("recording-tick".into())
            .spawn(move || {
                let mut next = Instant::now();
                while !recorder.cancel.is_cancelled() {
                    recorder.tick();
                    next += TICK_INTERVAL;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        // Behind schedule; skip the lost ticks instead of
                        // bursting.
                        next = now;
                    }
                }
            })
            .expect("failed to spawn recording tick thread")
    }

    /// PCM ingress from the voice connection. Only senders sharing the
    /// bot's channel are buffered.
    pub fn ingest_pcm(&self, client: ClientId, pcm: &[u8]) {
        if !self.directory.in_bot_channel(client) {
            return;
        }
        let now = self.now_ms();
        let mut inner = self.lock_inner();
        if inner.state.is_idle() {
            return;
        }
        inner
            .buffers
            .entry(client)
            .or_insert_with(|| PcmQueue::new(now))
            .write(pcm, now);
    }

    /// One 20ms mix tick. Called by the ticker thread; exposed so tests can
    /// step deterministically.
    pub fn tick(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.rotation_due() {
            if let Err(e) = self.rotate() {
                warn!(error = %e, "segment rotation failed, keeping current segment");
            }
        }

        let now = self.now_ms();
        let cfg = self.cfg.lock().expect("config lock poisoned").clone();
        let mut finalize: Option<(Box<OpenSegment>, String)> = None;
        let mut index_update: Option<(i64, u64, u64, Vec<Participant>)> = None;
        let mut needs_resume = false;

        {
            let mut inner = self.lock_inner();
            if inner.state.is_idle() {
                return;
            }

            if now.saturating_sub(inner.last_alone_check_ms) >= ALONE_CHECK_INTERVAL_MS {
                inner.last_alone_check_ms = now;
                let alone = is_alone(&self.directory.channel_members(), &cfg.exclude_uids);
                if alone != inner.alone {
                    needs_resume = Self::apply_alone_locked(&mut inner, alone, now, &cfg);
                }
            }

            if let ControlState::PendingStop { deadline_ms, .. } = &inner.state {
                if now >= *deadline_ms {
                    let state = mem::replace(&mut inner.state, ControlState::Idle);
                    if let ControlState::PendingStop {
                        segment, reason, ..
                    } = state
                    {
                        inner.buffers.clear();
                        finalize = Some((segment, reason));
                    }
                }
            }

            if finalize.is_none() {
                let Inner {
                    state,
                    buffers,
                    accum,
                    scratch,
                    mixed,
                    packet,
                    last_flush_ms,
                    ..
                } = &mut *inner;
                if let Some(seg) = state.segment_mut() {
                    if let Err(e) =
                        Self::mix_one_frame(seg, buffers, accum, scratch, mixed, packet, &*self.directory, now)
                    {
                        error!(error = %e, file_id = %seg.paths.file_id, "mix tick failed, closing segment");
                        let broken = mem::replace(state, ControlState::Idle);
                        buffers.clear();
                        if let Some(segment) = match broken {
                            ControlState::Active(s) => Some(s),
                            ControlState::PendingStop { segment, .. } => Some(segment),
                            ControlState::Idle => None,
                        } {
                            finalize = Some((segment, "mix failure".to_string()));
                        }
                    } else if now.saturating_sub(*last_flush_ms) >= FLUSH_INTERVAL_MS {
                        *last_flush_ms = now;
                        if let Err(e) = seg.writer.flush() {
                            warn!(error = %e, "segment flush failed");
                        }
                        if let Err(e) = seg.waveforms.flush() {
                            warn!(error = %e, "waveform flush failed");
                        }
                        index_update = Some((
                            seg.entry_id,
                            seg.writer.bytes_written(),
                            seg.writer.duration_ms(),
                            seg.participants.clone(),
                        ));
                    }
                }
            }
        }

        if let Some((entry_id, size, duration, participants)) = index_update {
            if let Err(e) = self
                .store
                .update_live(entry_id, size, duration, &participants)
            {
                warn!(error = %e, "live index update failed");
            }
        }
        if let Some((segment, reason)) = finalize {
            self.finalize_segment(*segment, &reason);
        }
        if needs_resume {
            self.resume_if_allowed();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn mix_one_frame(
        seg: &mut OpenSegment,
        buffers: &mut HashMap<ClientId, PcmQueue>,
        accum: &mut MixAccumulator,
        scratch: &mut [u8],
        mixed: &mut [i16],
        packet: &mut [u8],
        directory: &dyn ChannelDirectory,
        now: u64,
    ) -> Result<()> {
        accum.reset();
        let mut samples: Vec<TickSample> = Vec::new();
        buffers.retain(|client, queue| {
            if now.saturating_sub(queue.last_write()) > SENDER_STALE_AFTER_MS {
                debug!(client = *client, "dropping stale sender buffer");
                return false;
            }
            if queue.read_frame(scratch) {
                let loudness = accum.add_frame(scratch);
                if let Some(identity) = directory.identity(*client) {
                    samples.push(TickSample {
                        uid: identity.uid,
                        name: identity.name,
                        value: loudness,
                    });
                }
            }
            true
        });

        // No contributors still produces a silent frame and a zero sample on
        // every waveform track, keeping all streams tick-aligned.
        accum.write_mixed(mixed);
        let len = seg.encoder.encode(mixed, packet)?;
        seg.writer.write_packet(&packet[..len])?;

        let loudness: Vec<u8> = samples.iter().map(|s| s.value).collect();
        seg.waveforms
            .append_tick(&samples, combine_rms(&loudness))?;
        Ok(())
    }

    /// Alone-state transition under the lock. Returns whether the caller
    /// should try to start a segment after releasing it.
    fn apply_alone_locked(inner: &mut Inner, alone: bool, now: u64, cfg: &RecordingConfig) -> bool {
        inner.alone = alone;
        let state = mem::replace(&mut inner.state, ControlState::Idle);
        let (next, resume) = match (state, alone) {
            (ControlState::Active(segment), true) => {
                let delay = cfg.stop_delay();
                let reason = format!("channel empty > {}", cfg.stop_delay);
                info!(reason = %reason, "channel empty, stop pending");
                (
                    ControlState::PendingStop {
                        segment,
                        reason,
                        deadline_ms: now + delay.as_millis() as u64,
                    },
                    false,
                )
            }
            (ControlState::PendingStop { segment, .. }, false) => {
                info!("channel repopulated, stop cancelled");
                (ControlState::Active(segment), false)
            }
            (ControlState::Idle, false) => (ControlState::Idle, true),
            (other, _) => (other, false),
        };
        inner.state = next;
        resume
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.cfg.lock().expect("config lock poisoned").enabled = enabled;
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "recording toggled");
        if enabled {
            self.resume_if_allowed();
        } else {
            self.stop("disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn on_bot_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.resume_if_allowed();
    }

    pub fn on_bot_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.stop("bot disconnected");
    }

    pub fn on_alone_changed(&self, alone: bool) {
        let now = self.now_ms();
        let cfg = self.cfg.lock().expect("config lock poisoned").clone();
        let needs_resume = {
            let mut inner = self.lock_inner();
            if inner.alone == alone {
                false
            } else {
                Self::apply_alone_locked(&mut inner, alone, now, &cfg)
            }
        };
        if needs_resume {
            self.resume_if_allowed();
        }
    }

    /// Refresh the participant snapshot and re-evaluate aloneness,
    /// regardless of whether a segment is active.
    pub fn on_participants_changed(&self) {
        let members = self.directory.channel_members();
        let cfg = self.cfg.lock().expect("config lock poisoned").clone();
        let alone = is_alone(&members, &cfg.exclude_uids);
        let now = self.now_ms();

        let mut index_update: Option<(i64, u64, u64, Vec<Participant>)> = None;
        let needs_resume = {
            let mut inner = self.lock_inner();
            if let Some(seg) = inner.state.segment_mut() {
                union_participants(&mut seg.participants, &members);
                for member in &members {
                    if let Err(e) = seg.waveforms.ensure_track(&member.uid, &member.name) {
                        warn!(error = %e, uid = %member.uid, "failed to create participant sidecar");
                    }
                }
                index_update = Some((
                    seg.entry_id,
                    seg.writer.bytes_written(),
                    seg.writer.duration_ms(),
                    seg.participants.clone(),
                ));
            }
            if inner.alone != alone {
                Self::apply_alone_locked(&mut inner, alone, now, &cfg)
            } else {
                false
            }
        };

        if let Some((entry_id, size, duration, participants)) = index_update {
            if let Err(e) = self
                .store
                .update_live(entry_id, size, duration, &participants)
            {
                warn!(error = %e, "participant index update failed");
            }
        }
        if needs_resume {
            self.resume_if_allowed();
        }
    }

    /// Start a segment if enabled, connected, not alone and idle.
    pub fn resume_if_allowed(&self) {
        if self.disposed.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            return;
        }
        if !self.enabled.load(Ordering::SeqCst) || !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let cfg = self.cfg.lock().expect("config lock poisoned").clone();
        let alone = is_alone(&self.directory.channel_members(), &cfg.exclude_uids);
        {
            let mut inner = self.lock_inner();
            inner.alone = alone;
            if alone || !inner.state.is_idle() {
                return;
            }
        }
        if let Err(e) = self.start_segment(&cfg) {
            error!(error = %e, "failed to start recording segment");
        }
    }

    /// Stop and finalize whatever segment is open.
    pub fn stop(&self, reason: &str) {
        let segment = {
            let mut inner = self.lock_inner();
            inner.buffers.clear();
            match mem::replace(&mut inner.state, ControlState::Idle) {
                ControlState::Idle => None,
                ControlState::Active(segment) => Some(segment),
                ControlState::PendingStop { segment, .. } => Some(segment),
            }
        };
        if let Some(segment) = segment {
            self.finalize_segment(*segment, reason);
        }
    }

    pub fn status(&self) -> RecorderStatus {
        let inner = self.lock_inner();
        RecorderStatus {
            enabled: self.enabled.load(Ordering::SeqCst),
            active: !inner.state.is_idle(),
            current: inner.state.segment().map(|seg| self.live_entry_of(seg)),
        }
    }

    /// Live-built index record for the open segment, with size and duration
    /// read fresh under the recording mutex.
    pub fn live_entry(&self) -> Option<RecordingEntry> {
        let inner = self.lock_inner();
        inner.state.segment().map(|seg| self.live_entry_of(seg))
    }

    pub fn is_open_file_id(&self, file_id: &str) -> bool {
        let inner = self.lock_inner();
        inner
            .state
            .segment()
            .is_some_and(|seg| seg.paths.file_id == file_id)
    }

    /// Idempotent teardown: stops the tick, releases event handles and
    /// finalizes any open segment.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .clear();
        self.stop("shutdown");
        info!("recorder disposed");
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("recording mutex poisoned")
    }

    fn live_entry_of(&self, seg: &OpenSegment) -> RecordingEntry {
        let now = Utc::now();
        RecordingEntry {
            id: seg.paths.file_id.clone(),
            bot_id: self.bot_id,
            file_id: seg.paths.file_id.clone(),
            file_name: seg.paths.file_name.clone(),
            start: seg.start,
            end: None,
            size_bytes: seg.writer.bytes_written(),
            duration_ms: Some(seg.writer.duration_ms()),
            is_open: true,
            participants: seg.participants.clone(),
            waveforms: seg
                .waveforms
                .track_info()
                .into_iter()
                .map(|t| WaveformInfo {
                    file_id: format!("{}/{}", seg.dir_id, sidecar_name(&seg.paths.base, &t.uid)),
                    uid: t.uid,
                    name: t.name,
                    sample_rate: starling_media::mixer::WAVEFORM_RATE,
                    samples: t.samples,
                    max_sample: t.max_sample,
                    size_bytes: TSWF_HEADER_LEN + t.samples as u64,
                })
                .collect(),
            created: seg.start,
            updated: now,
        }
    }

    fn prepare_segment(&self, cfg: &RecordingConfig) -> Result<Box<OpenSegment>> {
        let start = Utc::now();
        let now = self.now_ms();
        let paths = segment::create_open_paths(&self.root, start)
            .context("failed to create segment paths")?;
        let dir_id = paths
            .file_id
            .rsplit_once('/')
            .map(|(d, _)| d.to_string())
            .unwrap_or_default();

        let cleanup = |paths: &SegmentPaths, entry_id: Option<i64>, store: &RecordingStore| {
            let _ = std::fs::remove_file(&paths.path);
            let _ = segment::delete_sidecars(&paths.path);
            if let Some(id) = entry_id {
                let _ = store.delete_row(id);
            }
        };

        let file = File::create(&paths.path)
            .with_context(|| format!("failed to create {}", paths.path.display()))?;
        let writer = match OggOpusWriter::new(file, 2) {
            Ok(w) => w,
            Err(e) => {
                cleanup(&paths, None, &self.store);
                return Err(e).context("failed to write ogg headers");
            }
        };
        let mut waveforms = match WaveformSet::new(&paths.dir, &paths.base) {
            Ok(w) => w,
            Err(e) => {
                cleanup(&paths, None, &self.store);
                return Err(e).context("failed to create waveform sidecars");
            }
        };

        let participants = to_participants(&self.directory.channel_members());
        // Everyone present at start gets a track, even if they never speak.
        for p in &participants {
            if let Err(e) = waveforms.ensure_track(&p.uid, &p.name) {
                cleanup(&paths, None, &self.store);
                return Err(e).context("failed to create participant sidecar");
            }
        }
        let entry_id = match self.store.insert_open(&NewRecording {
            bot_id: self.bot_id,
            file_id: paths.file_id.clone(),
            file_name: paths.file_name.clone(),
            start,
            size_bytes: writer.bytes_written(),
            participants: participants.clone(),
        }) {
            Ok(id) => id,
            Err(e) => {
                cleanup(&paths, None, &self.store);
                return Err(e).context("failed to insert index row");
            }
        };

        let encoder = match VoiceEncoder::new(cfg.bitrate) {
            Ok(enc) => enc,
            Err(e) => {
                cleanup(&paths, Some(entry_id), &self.store);
                return Err(e).context("failed to create encoder");
            }
        };

        Ok(Box::new(OpenSegment {
            start,
            started_ms: now,
            dir_id,
            paths,
            entry_id,
            writer,
            encoder,
            waveforms,
            participants,
        }))
    }

    fn start_segment(&self, cfg: &RecordingConfig) -> Result<()> {
        // Prepared outside the recording mutex; the swap below re-checks.
        let segment = self.prepare_segment(cfg)?;
        let rollback = {
            let mut inner = self.lock_inner();
            if inner.state.is_idle() && !self.disposed.load(Ordering::SeqCst) {
                let now = self.now_ms();
                inner.last_flush_ms = now;
                info!(file_id = %segment.paths.file_id, "recording started");
                inner.state = ControlState::Active(segment);
                None
            } else {
                Some(segment)
            }
        };
        if let Some(segment) = rollback {
            debug!("segment start lost the race, rolling back");
            let _ = self.store.delete_row(segment.entry_id);
            let _ = segment.waveforms.discard();
            let _ = std::fs::remove_file(&segment.paths.path);
        }
        Ok(())
    }

    fn rotation_due(&self) -> bool {
        let now = self.now_ms();
        let inner = self.lock_inner();
        // A segment in PendingStop is still the open segment being written
        // to, so it rotates on the same clock.
        inner
            .state
            .segment()
            .is_some_and(|seg| now.saturating_sub(seg.started_ms) >= SEGMENT_ROTATE_AFTER_MS)
    }

    /// Replace the current segment with a fresh one; the old segment is
    /// finalized after the swap, outside the mutex. A pending stop carries
    /// over to the fresh segment unchanged.
    fn rotate(&self) -> Result<()> {
        let cfg = self.cfg.lock().expect("config lock poisoned").clone();
        let fresh = self.prepare_segment(&cfg)?;
        let (old, rollback) = {
            let mut inner = self.lock_inner();
            match mem::replace(&mut inner.state, ControlState::Idle) {
                ControlState::Active(old) => {
                    inner.last_flush_ms = self.now_ms();
                    inner.state = ControlState::Active(fresh);
                    (Some(old), None)
                }
                ControlState::PendingStop {
                    segment: old,
                    reason,
                    deadline_ms,
                } => {
                    inner.last_flush_ms = self.now_ms();
                    inner.state = ControlState::PendingStop {
                        segment: fresh,
                        reason,
                        deadline_ms,
                    };
                    (Some(old), None)
                }
                // Stopped under us; abort the rotation.
                ControlState::Idle => (None, Some(fresh)),
            }
        };
        if let Some(old) = old {
            info!(file_id = %old.paths.file_id, "rotating segment after limit");
            self.finalize_segment(*old, "rotation");
        }
        if let Some(fresh) = rollback {
            let _ = self.store.delete_row(fresh.entry_id);
            let _ = fresh.waveforms.discard();
            let _ = std::fs::remove_file(&fresh.paths.path);
        }
        Ok(())
    }

    /// Close, rename and index one segment. Runs outside the recording
    /// mutex.
    fn finalize_segment(&self, segment: OpenSegment, reason: &str) {
        let OpenSegment {
            paths,
            entry_id,
            writer,
            encoder,
            waveforms,
            participants,
            ..
        } = segment;
        drop(encoder);

        let cfg = self.cfg.lock().expect("config lock poisoned").clone();
        let duration_ms = writer.duration_ms();
        match writer.finalize() {
            Ok(file) => {
                let _ = file.sync_all();
            }
            Err(e) => warn!(error = %e, "failed to write final ogg page"),
        }
        let closed = match waveforms.close() {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!(error = %e, "failed to close waveform sidecars");
                Vec::new()
            }
        };

        if (duration_ms as u128) < cfg.min_duration().as_millis() {
            info!(file_id = %paths.file_id, duration_ms, "recording discarded (too short)");
            let _ = std::fs::remove_file(&paths.path);
            let _ = segment::delete_sidecars(&paths.path);
            if let Err(e) = self.store.delete_row(entry_id) {
                warn!(error = %e, "failed to delete index row of discarded recording");
            }
            return;
        }

        let end = Utc::now();
        let finalized = match segment::rename_finalized(&self.root, &paths.path, end) {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, file_id = %paths.file_id, "failed to finalize segment files");
                return;
            }
        };
        let size_bytes = std::fs::metadata(&finalized.path)
            .map(|m| m.len())
            .unwrap_or(0);

        let by_uid: HashMap<&str, &starling_media::waveform::ClosedTrack> =
            closed.iter().map(|t| (t.uid.as_str(), t)).collect();
        let waveform_infos: Vec<WaveformInfo> = finalized
            .sidecars
            .iter()
            .map(|s| {
                let meta = by_uid.get(s.uid.as_str());
                WaveformInfo {
                    uid: s.uid.clone(),
                    name: meta.map(|m| m.name.clone()).unwrap_or_else(|| s.uid.clone()),
                    sample_rate: starling_media::mixer::WAVEFORM_RATE,
                    samples: meta.map(|m| m.samples).unwrap_or(0),
                    max_sample: meta.map(|m| m.max_sample).unwrap_or(0),
                    size_bytes: meta.map(|m| m.size_bytes).unwrap_or(0),
                    file_id: s.file_id.clone(),
                }
            })
            .collect();

        if let Err(e) = self.store.finalize_row(
            entry_id,
            &FinalizeUpdate {
                file_id: finalized.file_id.clone(),
                file_name: finalized.file_name.clone(),
                end,
                duration_ms,
                size_bytes,
                participants,
                waveforms: waveform_infos,
            },
        ) {
            warn!(error = %e, "failed to finalize index row");
        }
        info!(
            file_id = %finalized.file_id,
            duration_ms,
            size_bytes,
            reason,
            "recording finalized"
        );

        self.enforce_quota();
    }

    /// Drop the oldest finished recordings until the audio tree fits the
    /// configured quota. The open segment is never a victim.
    pub fn enforce_quota(&self) {
        let cfg = self.cfg.lock().expect("config lock poisoned").clone();
        let Some(limit) = cfg.max_total_size_bytes() else {
            return;
        };
        let current = {
            let inner = self.lock_inner();
            inner.state.segment().map(|seg| seg.paths.path.clone())
        };
        quota::enforce_quota(
            &self.root,
            self.bot_id,
            &self.store,
            limit,
            current.as_deref(),
        );
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn to_participants(members: &[Identity]) -> Vec<Participant> {
    members
        .iter()
        .map(|m| Participant {
            uid: m.uid.clone(),
            name: m.name.clone(),
        })
        .collect()
}

fn union_participants(existing: &mut Vec<Participant>, members: &[Identity]) {
    for member in members {
        if !existing.iter().any(|p| p.uid == member.uid) {
            existing.push(Participant {
                uid: member.uid.clone(),
                name: member.name.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StaticDirectory;
    use starling_store::ListFilter;

    fn member(uid: &str) -> Identity {
        Identity {
            uid: uid.into(),
            name: uid.to_uppercase(),
        }
    }

    fn setup() -> (
        tempfile::TempDir,
        Arc<RecordingStore>,
        Arc<StaticDirectory>,
        Arc<Recorder>,
    ) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordingStore::open_in_memory().unwrap());
        let directory = Arc::new(StaticDirectory::new());
        directory.set_members(vec![(1, member("alice"))]);
        let cfg = RecordingConfig {
            enabled: true,
            min_duration: "0s".into(),
            ..Default::default()
        };
        let recorder = Recorder::new(
            1,
            tmp.path().to_path_buf(),
            cfg,
            store.clone(),
            directory.clone() as Arc<dyn ChannelDirectory>,
        );
        recorder.on_bot_connected();
        (tmp, store, directory, recorder)
    }

    #[test]
    fn rotation_swaps_in_a_fresh_segment() {
        let (_tmp, store, _directory, recorder) = setup();
        for _ in 0..5 {
            recorder.tick();
        }
        let old_id = recorder.live_entry().unwrap().file_id;

        {
            let mut inner = recorder.lock_inner();
            if let ControlState::Active(seg) = &mut inner.state {
                seg.started_ms = 0;
            }
        }
        recorder.advance_clock(SEGMENT_ROTATE_AFTER_MS);
        recorder.tick();

        let live = recorder.live_entry().expect("still recording");
        assert_ne!(live.file_id, old_id);

        let rows = store.list(1, &ListFilter::default()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|r| r.is_open).count(), 1);
        let closed = rows.iter().find(|r| !r.is_open).unwrap();
        assert!(closed.end.is_some());
        recorder.dispose();
    }

    #[test]
    fn rotation_also_applies_during_pending_stop() {
        let (_tmp, store, directory, recorder) = setup();
        for _ in 0..5 {
            recorder.tick();
        }
        let old_id = recorder.live_entry().unwrap().file_id;

        recorder
            .cfg
            .lock()
            .unwrap()
            .stop_delay = "2h".into();
        directory.clear();
        recorder.on_alone_changed(true);

        {
            let mut inner = recorder.lock_inner();
            if let ControlState::PendingStop { segment, .. } = &mut inner.state {
                segment.started_ms = 0;
            }
        }
        recorder.advance_clock(SEGMENT_ROTATE_AFTER_MS);
        recorder.tick();

        // The segment rotated and the pending stop carried over to the
        // fresh one: the deadline is still an hour out.
        let live = recorder.live_entry().expect("still recording");
        assert_ne!(live.file_id, old_id);
        assert!(matches!(
            recorder.lock_inner().state,
            ControlState::PendingStop { .. }
        ));

        let rows = store.list(1, &ListFilter::default()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|r| r.is_open).count(), 1);
        recorder.dispose();
    }

    #[test]
    fn stale_sender_buffers_are_evicted() {
        let (_tmp, _store, _directory, recorder) = setup();
        recorder.ingest_pcm(1, &[0u8; FRAME_BYTES]);
        assert_eq!(recorder.lock_inner().buffers.len(), 1);

        recorder.advance_clock(SENDER_STALE_AFTER_MS + 1);
        recorder.tick();
        assert!(recorder.lock_inner().buffers.is_empty());
        recorder.dispose();
    }

    #[test]
    fn ingress_is_dropped_while_idle() {
        let (_tmp, _store, _directory, recorder) = setup();
        recorder.stop("test");
        recorder.ingest_pcm(1, &[0u8; FRAME_BYTES]);
        assert!(recorder.lock_inner().buffers.is_empty());
        recorder.dispose();
    }

    #[test]
    fn start_is_refused_while_disconnected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordingStore::open_in_memory().unwrap());
        let directory = Arc::new(StaticDirectory::new());
        directory.set_members(vec![(1, member("alice"))]);
        let cfg = RecordingConfig {
            enabled: true,
            ..Default::default()
        };
        let recorder = Recorder::new(
            1,
            tmp.path().to_path_buf(),
            cfg,
            store,
            directory as Arc<dyn ChannelDirectory>,
        );
        recorder.resume_if_allowed();
        assert!(!recorder.status().active);
        recorder.dispose();
    }
}
