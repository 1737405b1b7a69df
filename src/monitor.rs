//! Promiscuous capture engine
//!
//! Frames arrive on the radio driver's receive context through
//! [`receive_trampoline`], which forwards into the engine registered with
//! [`register_global`]. Statistics are plain atomics. Capture records are
//! queued without blocking to a dedicated writer thread that owns the capture
//! file, so the receive context never touches the sink.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::{FrameType, ManagementKind, PacketInfo};
use crate::phy::{RadioDriver, RxCallback, RxFrame};
use crate::wire::{CaptureRecord, PcapWriter};
use crate::{is_valid_channel, MctError, Result, MAX_CHANNEL, MIN_CHANNEL};

/// Default depth of the capture record queue
pub const CAPTURE_QUEUE_DEPTH: usize = 256;

const WRITER_ACK_TIMEOUT: Duration = Duration::from_secs(2);

static ENGINE: OnceLock<Arc<CaptureEngine>> = OnceLock::new();

/// Register the process-wide engine that receives radio frames. Only the
/// first registration takes effect.
pub fn register_global(engine: Arc<CaptureEngine>) -> bool {
    ENGINE.set(engine).is_ok()
}

pub fn global() -> Option<&'static Arc<CaptureEngine>> {
    ENGINE.get()
}

/// Receive hook handed to the radio driver
pub fn receive_trampoline(frame: &RxFrame<'_>) {
    if let Some(engine) = ENGINE.get() {
        engine.process_frame(frame);
    }
}

/// Observer invoked for every classified frame
pub type PacketCallback = Arc<dyn Fn(&PacketInfo) + Send + Sync>;

/// Point-in-time copy of the capture counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    pub monitoring: bool,
    pub channel: u8,
    #[serde(rename = "packets_total")]
    pub total_packets: u32,
    #[serde(rename = "packets_per_sec")]
    pub packets_per_second: u32,
    pub beacon_count: u32,
    pub probe_count: u32,
    pub deauth_count: u32,
    pub data_count: u32,
    pub mgmt_count: u32,
    pub ctrl_count: u32,
    pub capture_dropped: u32,
    pub elapsed_ms: u64,
    pub capture_active: bool,
}

impl CaptureStats {
    /// `total / max(1, elapsed seconds)`, zero when idle or empty
    pub fn rate(monitoring: bool, total: u32, elapsed: Duration) -> u32 {
        if !monitoring || total == 0 {
            return 0;
        }
        let secs = elapsed.as_secs().max(1);
        (u64::from(total) / secs) as u32
    }
}

/// Outcome of a closed capture file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSummary {
    pub records: u64,
    pub bytes: u64,
    pub dropped: u32,
}

enum WriterMessage {
    Open {
        sink: Box<dyn Write + Send>,
        ack: Sender<Result<()>>,
    },
    Record(CaptureRecord),
    Close {
        ack: Sender<CaptureSummary>,
    },
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU32,
    beacons: AtomicU32,
    probes: AtomicU32,
    deauths: AtomicU32,
    data: AtomicU32,
    mgmt: AtomicU32,
    ctrl: AtomicU32,
    dropped: AtomicU32,
}

impl Counters {
    fn reset(&self) {
        for counter in [
            &self.total,
            &self.beacons,
            &self.probes,
            &self.deauths,
            &self.data,
            &self.mgmt,
            &self.ctrl,
            &self.dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Radio capture engine
pub struct CaptureEngine {
    radio: Arc<dyn RadioDriver>,
    rx_hook: RxCallback,
    epoch: Instant,
    monitoring: AtomicBool,
    started_ms: AtomicU64,
    last_packet_ms: AtomicU64,
    counters: Arc<Counters>,
    capture_active: AtomicBool,
    queue: Sender<WriterMessage>,
    writer: Mutex<Option<JoinHandle<()>>>,
    callback: RwLock<Option<PacketCallback>>,
}

impl std::fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("monitoring", &self.is_monitoring())
            .field("capture_active", &self.is_capture_active())
            .field("counters", &self.counters)
            .finish()
    }
}

impl CaptureEngine {
    /// Create an engine and spawn its capture writer thread
    pub fn new(radio: Arc<dyn RadioDriver>, queue_depth: usize) -> Result<Self> {
        let (queue, rx) = bounded(queue_depth.max(1));
        let counters = Arc::new(Counters::default());
        let writer_counters = Arc::clone(&counters);
        let writer = std::thread::Builder::new()
            .name("capture-writer".to_string())
            .spawn(move || run_writer(rx, &writer_counters))?;

        Ok(Self {
            radio,
            rx_hook: receive_trampoline,
            epoch: Instant::now(),
            monitoring: AtomicBool::new(false),
            started_ms: AtomicU64::new(0),
            last_packet_ms: AtomicU64::new(0),
            counters,
            capture_active: AtomicBool::new(false),
            queue,
            writer: Mutex::new(Some(writer)),
            callback: RwLock::new(None),
        })
    }

    /// Replace the hook installed on the radio when monitoring starts
    pub fn with_rx_hook(mut self, hook: RxCallback) -> Self {
        self.rx_hook = hook;
        self
    }

    pub fn radio(&self) -> &Arc<dyn RadioDriver> {
        &self.radio
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Acquire)
    }

    pub fn is_capture_active(&self) -> bool {
        self.capture_active.load(Ordering::Acquire)
    }

    pub fn channel(&self) -> u8 {
        self.radio.channel()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Enter promiscuous capture. A `channel` of 0 keeps the current one.
    pub fn start_monitor(&self, channel: u8) -> Result<()> {
        if self.is_monitoring() {
            return Err(MctError::Busy("Already monitoring".to_string()));
        }
        if channel != 0 && !is_valid_channel(channel) {
            return Err(MctError::InvalidParameter(format!(
                "Channel must be {}-{}",
                MIN_CHANNEL, MAX_CHANNEL
            )));
        }

        self.counters.reset();
        if channel != 0 {
            self.radio.set_channel(channel)?;
        }

        self.radio.set_rx_callback(Some(self.rx_hook));
        if let Err(e) = self.radio.set_promiscuous(true) {
            self.radio.set_rx_callback(None);
            return Err(e.into());
        }

        let now = self.now_ms();
        self.started_ms.store(now, Ordering::Release);
        self.last_packet_ms.store(now, Ordering::Release);
        self.monitoring.store(true, Ordering::Release);

        log::info!("Monitor mode started on channel {}", self.radio.channel());
        Ok(())
    }

    /// Leave promiscuous capture, closing any open capture file. Returns the
    /// final statistics.
    pub fn stop_monitor(&self) -> CaptureStats {
        if self.is_capture_active() {
            if let Err(e) = self.stop_capture() {
                log::warn!("Failed to close capture: {}", e);
            }
        }

        let stats = self.stats();
        if !self.monitoring.swap(false, Ordering::AcqRel) {
            return stats;
        }

        if let Err(e) = self.radio.set_promiscuous(false) {
            log::warn!("Failed to disable promiscuous mode: {}", e);
        }
        self.radio.set_rx_callback(None);

        log::info!(
            "Monitor mode stopped: {} packets ({} beacons, {} deauths)",
            stats.total_packets,
            stats.beacon_count,
            stats.deauth_count
        );
        stats
    }

    pub fn set_channel(&self, channel: u8) -> Result<()> {
        if !self.is_monitoring() {
            return Err(MctError::Protocol("Not in monitor mode".to_string()));
        }
        if !is_valid_channel(channel) {
            return Err(MctError::InvalidParameter(format!(
                "Channel must be {}-{}",
                MIN_CHANNEL, MAX_CHANNEL
            )));
        }
        self.radio.set_channel(channel)?;
        log::debug!("Monitor channel set to {}", channel);
        Ok(())
    }

    /// Advance to the next channel, wrapping from 14 back to 1
    pub fn hop_channel(&self) -> Result<u8> {
        let current = self.radio.channel();
        let next = if current >= MAX_CHANNEL || current < MIN_CHANNEL {
            MIN_CHANNEL
        } else {
            current + 1
        };
        self.set_channel(next)?;
        Ok(next)
    }

    pub fn set_packet_callback(&self, callback: Option<PacketCallback>) {
        if let Ok(mut guard) = self.callback.write() {
            *guard = callback;
        }
    }

    /// Account for one received frame. Runs on the radio receive context.
    pub fn process_frame(&self, frame: &RxFrame<'_>) -> Option<PacketInfo> {
        if !self.is_monitoring() {
            return None;
        }

        let now = self.now_ms();
        Counters::bump(&self.counters.total);
        self.last_packet_ms.store(now, Ordering::Release);

        let info = PacketInfo::classify(frame.payload, frame.channel, frame.rssi, now as u32);

        if let Some(info) = &info {
            self.count(info);
        }

        if self.is_capture_active() {
            let record = CaptureRecord::new(now as u32, frame.payload);
            match self.queue.try_send(WriterMessage::Record(record)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    Counters::bump(&self.counters.dropped);
                }
            }
        }

        let info = info?;
        let callback = self.callback.read().ok().and_then(|guard| guard.clone());
        if let Some(callback) = callback {
            callback(&info);
        }

        Some(info)
    }

    fn count(&self, info: &PacketInfo) {
        match info.frame_type {
            FrameType::Management => {
                Counters::bump(&self.counters.mgmt);
                match info.management_kind() {
                    Some(ManagementKind::Beacon) => Counters::bump(&self.counters.beacons),
                    Some(ManagementKind::ProbeRequest) | Some(ManagementKind::ProbeResponse) => {
                        Counters::bump(&self.counters.probes)
                    }
                    Some(ManagementKind::Deauthentication) => {
                        Counters::bump(&self.counters.deauths)
                    }
                    _ => {}
                }
            }
            FrameType::Data => Counters::bump(&self.counters.data),
            FrameType::Control => Counters::bump(&self.counters.ctrl),
            FrameType::Extension => {}
        }
    }

    /// Packets per second since monitoring started
    pub fn packets_per_second(&self) -> u32 {
        CaptureStats::rate(
            self.is_monitoring(),
            self.counters.total.load(Ordering::Relaxed),
            self.elapsed(),
        )
    }

    fn elapsed(&self) -> Duration {
        let started = self.started_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(started))
    }

    /// Time since the last processed frame (or since start)
    pub fn idle_for(&self) -> Duration {
        let last = self.last_packet_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    pub fn stats(&self) -> CaptureStats {
        let load = |c: &AtomicU32| c.load(Ordering::Relaxed);
        let monitoring = self.is_monitoring();
        let total = load(&self.counters.total);
        let elapsed = if monitoring {
            self.elapsed()
        } else {
            Duration::ZERO
        };

        CaptureStats {
            monitoring,
            channel: self.radio.channel(),
            total_packets: total,
            packets_per_second: CaptureStats::rate(monitoring, total, elapsed),
            beacon_count: load(&self.counters.beacons),
            probe_count: load(&self.counters.probes),
            deauth_count: load(&self.counters.deauths),
            data_count: load(&self.counters.data),
            mgmt_count: load(&self.counters.mgmt),
            ctrl_count: load(&self.counters.ctrl),
            capture_dropped: load(&self.counters.dropped),
            elapsed_ms: elapsed.as_millis() as u64,
            capture_active: self.is_capture_active(),
        }
    }

    /// Open a capture file on `sink`. The global header is written before
    /// this returns.
    pub fn start_capture(&self, sink: Box<dyn Write + Send>) -> Result<()> {
        if self.is_capture_active() {
            return Err(MctError::Busy("Capture already active".to_string()));
        }

        let (ack, ack_rx) = bounded(1);
        self.queue
            .send(WriterMessage::Open { sink, ack })
            .map_err(|_| MctError::Capture("Capture writer stopped".to_string()))?;

        match ack_rx.recv_timeout(WRITER_ACK_TIMEOUT) {
            Ok(Ok(())) => {
                self.capture_active.store(true, Ordering::Release);
                log::info!("Capture started");
                Ok(())
            }
            Ok(Err(e)) => Err(MctError::Capture(format!("Failed to write header: {}", e))),
            Err(_) => Err(MctError::Timeout("Capture writer did not respond".to_string())),
        }
    }

    /// Close the capture file after every queued record is written
    pub fn stop_capture(&self) -> Result<CaptureSummary> {
        if !self.capture_active.swap(false, Ordering::AcqRel) {
            return Err(MctError::Capture("No capture active".to_string()));
        }

        let (ack, ack_rx) = bounded(1);
        self.queue
            .send(WriterMessage::Close { ack })
            .map_err(|_| MctError::Capture("Capture writer stopped".to_string()))?;

        let mut summary = ack_rx
            .recv_timeout(WRITER_ACK_TIMEOUT)
            .map_err(|_| MctError::Timeout("Capture writer did not respond".to_string()))?;
        summary.dropped = self.counters.dropped.load(Ordering::Relaxed);

        log::info!(
            "Capture stopped: {} records, {} bytes, {} dropped",
            summary.records,
            summary.bytes,
            summary.dropped
        );
        Ok(summary)
    }

    /// Stop monitoring and join the writer thread
    pub fn shutdown(&self) {
        self.stop_monitor();
        if self.queue.send(WriterMessage::Shutdown).is_err() {
            log::debug!("Capture writer already stopped");
        }
        let handle = self.writer.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Capture writer panicked");
            }
        }
    }
}

type FileWriter = PcapWriter<BufWriter<Box<dyn Write + Send>>>;

fn run_writer(rx: Receiver<WriterMessage>, counters: &Counters) {
    let mut current: Option<FileWriter> = None;

    for message in rx.iter() {
        match message {
            WriterMessage::Open { sink, ack } => {
                if let Some(previous) = current.take() {
                    close_writer(previous);
                }
                // the header reaches the sink before the open is acknowledged
                let result = PcapWriter::new(BufWriter::new(sink)).and_then(|mut writer| {
                    writer.flush()?;
                    current = Some(writer);
                    Ok(())
                });
                if ack.send(result).is_err() {
                    log::warn!("Capture open finished after the caller gave up");
                }
            }
            WriterMessage::Record(record) => match current.as_mut() {
                Some(writer) => {
                    if let Err(e) = writer.write_record(&record) {
                        log::warn!("Capture write failed: {}", e);
                    }
                }
                None => {
                    // queued just before the file was closed
                    Counters::bump(&counters.dropped);
                    log::debug!("Dropped {} byte record with no capture open", record.data.len());
                }
            },
            WriterMessage::Close { ack } => {
                let summary = current.take().map(close_writer).unwrap_or_default();
                if ack.send(summary).is_err() {
                    log::warn!("Capture close finished after the caller gave up");
                }
            }
            WriterMessage::Shutdown => break,
        }
    }

    if let Some(writer) = current.take() {
        close_writer(writer);
    }
    log::debug!("Capture writer exiting");
}

fn close_writer(writer: FileWriter) -> CaptureSummary {
    let summary = CaptureSummary {
        records: writer.records(),
        bytes: writer.bytes_written(),
        dropped: 0,
    };
    if let Err(e) = writer.finish() {
        log::warn!("Capture flush failed: {}", e);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::SimRadio;
    use crate::wire::{PcapRecordHeader, GLOBAL_HEADER_LEN, RECORD_HEADER_LEN};
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn noop_hook(_: &RxFrame<'_>) {}

    fn engine() -> (Arc<SimRadio>, CaptureEngine) {
        let radio = Arc::new(SimRadio::new());
        let engine = CaptureEngine::new(radio.clone(), 16)
            .unwrap()
            .with_rx_hook(noop_hook);
        (radio, engine)
    }

    fn rx(payload: &[u8]) -> RxFrame<'_> {
        RxFrame {
            payload,
            channel: 6,
            rssi: -42,
        }
    }

    fn frame(fc: [u8; 2]) -> Vec<u8> {
        let mut f = vec![0u8; 24];
        f[..2].copy_from_slice(&fc);
        f
    }

    #[test]
    fn test_start_stop_monitor() {
        let (radio, engine) = engine();
        engine.start_monitor(6).unwrap();
        assert!(engine.is_monitoring());
        assert!(radio.is_promiscuous());
        assert_eq!(engine.channel(), 6);

        assert!(matches!(engine.start_monitor(1), Err(MctError::Busy(_))));

        engine.stop_monitor();
        assert!(!engine.is_monitoring());
        assert!(!radio.is_promiscuous());

        // idempotent
        engine.stop_monitor();
    }

    #[test]
    fn test_start_monitor_rejects_bad_channel() {
        let (radio, engine) = engine();
        assert!(engine.start_monitor(15).is_err());
        assert!(!engine.is_monitoring());
        assert!(!radio.is_promiscuous());
    }

    #[test]
    fn test_start_monitor_promiscuous_refused() {
        let (radio, engine) = engine();
        radio.refuse_promiscuous(true);
        assert!(matches!(engine.start_monitor(0), Err(MctError::Radio(_))));
        assert!(!engine.is_monitoring());
    }

    #[test]
    fn test_frame_counters() {
        let (_radio, engine) = engine();
        engine.start_monitor(0).unwrap();

        engine.process_frame(&rx(&frame([0x80, 0x00]))); // beacon
        engine.process_frame(&rx(&frame([0x80, 0x00])));
        engine.process_frame(&rx(&frame([0xC0, 0x00]))); // deauth
        engine.process_frame(&rx(&frame([0x40, 0x00]))); // probe request
        engine.process_frame(&rx(&frame([0x50, 0x00]))); // probe response
        engine.process_frame(&rx(&frame([0x08, 0x00]))); // data
        engine.process_frame(&rx(&[0xD4, 0x00, 0, 0, 0, 0, 0, 0, 0, 0])); // ack
        engine.process_frame(&rx(&[0x80])); // truncated

        let stats = engine.stats();
        assert_eq!(stats.total_packets, 8);
        assert_eq!(stats.beacon_count, 2);
        assert_eq!(stats.deauth_count, 1);
        assert_eq!(stats.probe_count, 2);
        assert_eq!(stats.mgmt_count, 5);
        assert_eq!(stats.data_count, 1);
        assert_eq!(stats.ctrl_count, 1);
    }

    #[test]
    fn test_frames_ignored_when_stopped() {
        let (_radio, engine) = engine();
        assert!(engine.process_frame(&rx(&frame([0x80, 0x00]))).is_none());
        assert_eq!(engine.stats().total_packets, 0);
    }

    #[test]
    fn test_counters_reset_on_restart() {
        let (_radio, engine) = engine();
        engine.start_monitor(0).unwrap();
        engine.process_frame(&rx(&frame([0x80, 0x00])));
        engine.stop_monitor();
        assert_eq!(engine.stats().total_packets, 1);

        engine.start_monitor(0).unwrap();
        assert_eq!(engine.stats().total_packets, 0);
    }

    #[test]
    fn test_idle_time_resets_on_frame() {
        let (_radio, engine) = engine();
        engine.start_monitor(0).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(engine.idle_for() >= Duration::from_millis(50));

        engine.process_frame(&rx(&frame([0x80, 0x00])));
        assert!(engine.idle_for() < Duration::from_millis(50));
    }

    #[test]
    fn test_packets_per_second() {
        let (_radio, engine) = engine();
        assert_eq!(engine.packets_per_second(), 0);
        engine.start_monitor(0).unwrap();
        assert_eq!(engine.packets_per_second(), 0);

        for _ in 0..10 {
            engine.process_frame(&rx(&frame([0x08, 0x00])));
        }
        // under one second elapsed: divided by 1
        assert_eq!(engine.packets_per_second(), 10);
    }

    #[test]
    fn test_rate_steady_state() {
        let mut previous = 0;
        for secs in 1..=5u64 {
            let rate = CaptureStats::rate(true, (secs * 20) as u32, Duration::from_secs(secs));
            assert!(rate >= previous);
            previous = rate;
        }
        assert_eq!(CaptureStats::rate(false, 100, Duration::from_secs(1)), 0);
        assert_eq!(CaptureStats::rate(true, 0, Duration::from_secs(3)), 0);
    }

    #[test]
    fn test_channel_control() {
        let (_radio, engine) = engine();
        assert!(engine.set_channel(3).is_err());
        assert!(engine.hop_channel().is_err());

        engine.start_monitor(13).unwrap();
        assert_eq!(engine.hop_channel().unwrap(), 14);
        assert_eq!(engine.hop_channel().unwrap(), 1);
        assert_eq!(engine.hop_channel().unwrap(), 2);
        assert!(engine.set_channel(0).is_err());
        engine.set_channel(9).unwrap();
        assert_eq!(engine.channel(), 9);
    }

    #[test]
    fn test_packet_callback() {
        let (_radio, engine) = engine();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        engine.set_packet_callback(Some(Arc::new(move |info: &PacketInfo| {
            assert_eq!(info.channel, 6);
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        engine.start_monitor(0).unwrap();
        engine.process_frame(&rx(&frame([0x80, 0x00])));
        engine.process_frame(&rx(&frame([0x08, 0x00])));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_capture_file_contents() {
        let (_radio, engine) = engine();
        let buf = SharedBuf::default();
        engine.start_monitor(0).unwrap();
        engine.start_capture(Box::new(buf.clone())).unwrap();
        assert!(engine.is_capture_active());
        assert!(engine.start_capture(Box::new(SharedBuf::default())).is_err());

        let beacon = frame([0x80, 0x00]);
        engine.process_frame(&rx(&beacon));
        engine.process_frame(&rx(&[0xC0, 0x00, 0x01]));

        let summary = engine.stop_capture().unwrap();
        assert_eq!(summary.records, 2);
        assert!(engine.stop_capture().is_err());

        let out = buf.0.lock().unwrap().clone();
        assert_eq!(&out[0..4], &[0xD4, 0xC3, 0xB2, 0xA1]);
        let first = PcapRecordHeader::parse(&out[GLOBAL_HEADER_LEN..]).unwrap();
        assert_eq!(first.incl_len, 24);
        assert_eq!(first.incl_len, first.orig_len);
        let body = GLOBAL_HEADER_LEN + RECORD_HEADER_LEN;
        assert_eq!(&out[body..body + 24], &beacon[..]);
        assert_eq!(out.len(), GLOBAL_HEADER_LEN + 2 * RECORD_HEADER_LEN + 24 + 3);
    }

    #[test]
    fn test_capture_record_timestamps() {
        let (_radio, engine) = engine();
        let buf = SharedBuf::default();
        engine.start_monitor(0).unwrap();
        engine.start_capture(Box::new(buf.clone())).unwrap();

        let first = engine.process_frame(&rx(&frame([0x80, 0x00]))).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        let second = engine.process_frame(&rx(&frame([0x08, 0x00]))).unwrap();
        engine.stop_capture().unwrap();

        let out = buf.0.lock().unwrap().clone();
        let h1 = PcapRecordHeader::parse(&out[GLOBAL_HEADER_LEN..]).unwrap();
        let h2 = PcapRecordHeader::parse(&out[GLOBAL_HEADER_LEN + RECORD_HEADER_LEN + 24..]).unwrap();

        for (header, info) in [(&h1, &first), (&h2, &second)] {
            assert_eq!(header.ts_sec, info.timestamp_ms / 1000);
            assert_eq!(header.ts_usec, (info.timestamp_ms % 1000) * 1000);
            assert!(header.ts_usec < 1_000_000);
        }
        assert!(h2.ts_sec >= h1.ts_sec + 1);
    }

    #[test]
    fn test_record_between_captures_is_counted() {
        let (_radio, engine) = engine();
        engine.start_monitor(0).unwrap();
        let first = SharedBuf::default();
        engine.start_capture(Box::new(first.clone())).unwrap();
        engine.stop_capture().unwrap();

        // frames received with no capture open are not queued
        engine.process_frame(&rx(&frame([0x80, 0x00])));
        assert_eq!(engine.stats().capture_dropped, 0);

        // a record queued just before the close lands after it
        engine
            .queue
            .send(WriterMessage::Record(CaptureRecord::new(5, &frame([0x80, 0x00]))))
            .unwrap();

        let second = SharedBuf::default();
        engine.start_capture(Box::new(second.clone())).unwrap();
        let summary = engine.stop_capture().unwrap();

        assert_eq!(summary.records, 0);
        assert_eq!(summary.dropped, 1);
        assert_eq!(engine.stats().capture_dropped, 1);
        assert_eq!(first.0.lock().unwrap().len(), GLOBAL_HEADER_LEN);
        assert_eq!(second.0.lock().unwrap().len(), GLOBAL_HEADER_LEN);
    }

    #[test]
    fn test_stop_monitor_closes_capture() {
        let (_radio, engine) = engine();
        let buf = SharedBuf::default();
        engine.start_monitor(0).unwrap();
        engine.start_capture(Box::new(buf.clone())).unwrap();
        engine.process_frame(&rx(&frame([0x80, 0x00])));

        engine.stop_monitor();
        assert!(!engine.is_capture_active());
        assert_eq!(
            buf.0.lock().unwrap().len(),
            GLOBAL_HEADER_LEN + RECORD_HEADER_LEN + 24
        );
    }

    #[test]
    fn test_shutdown_joins_writer() {
        let (_radio, engine) = engine();
        engine.start_monitor(0).unwrap();
        engine.shutdown();
        assert!(!engine.is_monitoring());
        assert!(engine.start_capture(Box::new(SharedBuf::default())).is_err());
    }
}
