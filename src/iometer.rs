//! IO metering across ten operation classes.
//!
//! The meter tracks bytes charged per class and a recent bytes/sec signal
//! the journal copier uses to speed up while the system is quiescent. An
//! optional binary diagnostic log records one fixed 37-byte record per
//! charge.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::Result;

/// Operation classes, in opcode order starting at 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IoClass {
    ReadPageFromVolume = 1,
    ReadPageFromJournal = 2,
    WritePageToVolume = 3,
    WritePageToJournal = 4,
    WriteTxToJournal = 5,
    WriteOtherToJournal = 6,
    EvictPage = 7,
    FlushJournal = 8,
    CopyPageToVolume = 9,
    DeleteJournalFile = 10,
}

pub const IO_CLASS_COUNT: usize = 10;

/// Fixed size of one diagnostic log record.
pub const IO_LOG_RECORD_SIZE: usize = 37;

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Byte/sec meter shared by every I/O path.
pub struct IoMeter {
    bytes_by_class: [AtomicU64; IO_CLASS_COUNT],
    ops_by_class: [AtomicU64; IO_CLASS_COUNT],
    window: Mutex<VecDeque<(Instant, u64)>>,
    log: Mutex<Option<BufWriter<File>>>,
}

/// Context fields carried into the diagnostic log.
#[derive(Clone, Copy, Debug, Default)]
pub struct IoContext {
    pub volume_handle: i32,
    pub page_address: u64,
    pub journal_address: u64,
    pub buffer_index: i32,
}

impl IoMeter {
    pub fn new() -> Self {
        Self {
            bytes_by_class: Default::default(),
            ops_by_class: Default::default(),
            window: Mutex::new(VecDeque::new()),
            log: Mutex::new(None),
        }
    }

    /// Opens the optional binary diagnostic log.
    pub fn open_log(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        *self.log.lock() = Some(BufWriter::new(file));
        Ok(())
    }

    pub fn close_log(&self) -> Result<()> {
        if let Some(mut writer) = self.log.lock().take() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Charges `size` bytes against `class`.
    pub fn charge(&self, class: IoClass, size: usize, context: IoContext) {
        let slot = class as usize - 1;
        self.bytes_by_class[slot].fetch_add(size as u64, Ordering::Relaxed);
        self.ops_by_class[slot].fetch_add(1, Ordering::Relaxed);
        {
            let mut window = self.window.lock();
            let now = Instant::now();
            window.push_back((now, size as u64));
            while let Some(&(t, _)) = window.front() {
                if now.duration_since(t) > RATE_WINDOW {
                    window.pop_front();
                } else {
                    break;
                }
            }
        }
        let mut log = self.log.lock();
        if let Some(writer) = log.as_mut() {
            let mut record = [0u8; IO_LOG_RECORD_SIZE];
            record[0] = class as u8;
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            record[1..9].copy_from_slice(&millis.to_le_bytes());
            record[9..13].copy_from_slice(&context.volume_handle.to_le_bytes());
            record[13..21].copy_from_slice(&context.page_address.to_le_bytes());
            record[21..25].copy_from_slice(&(size as u32).to_le_bytes());
            record[25..33].copy_from_slice(&context.journal_address.to_le_bytes());
            record[33..37].copy_from_slice(&context.buffer_index.to_le_bytes());
            let _ = writer.write_all(&record);
        }
    }

    /// Bytes charged in the trailing window, expressed as KB/sec.
    pub fn recent_rate_kb_per_s(&self) -> u64 {
        let mut window = self.window.lock();
        let now = Instant::now();
        while let Some(&(t, _)) = window.front() {
            if now.duration_since(t) > RATE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        let bytes: u64 = window.iter().map(|&(_, b)| b).sum();
        bytes / 1024
    }

    pub fn bytes_for(&self, class: IoClass) -> u64 {
        self.bytes_by_class[class as usize - 1].load(Ordering::Relaxed)
    }

    pub fn ops_for(&self, class: IoClass) -> u64 {
        self.ops_by_class[class as usize - 1].load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_by_class
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for IoMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charges_accumulate_per_class() {
        let meter = IoMeter::new();
        meter.charge(IoClass::ReadPageFromVolume, 4096, IoContext::default());
        meter.charge(IoClass::ReadPageFromVolume, 4096, IoContext::default());
        meter.charge(IoClass::FlushJournal, 100, IoContext::default());
        assert_eq!(meter.bytes_for(IoClass::ReadPageFromVolume), 8192);
        assert_eq!(meter.ops_for(IoClass::ReadPageFromVolume), 2);
        assert_eq!(meter.total_bytes(), 8292);
    }

    #[test]
    fn recent_rate_reflects_window() {
        let meter = IoMeter::new();
        meter.charge(IoClass::WritePageToJournal, 64 * 1024, IoContext::default());
        assert!(meter.recent_rate_kb_per_s() >= 64);
    }

    #[test]
    fn log_records_are_fixed_width() -> Result<()> {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("io.log");
        let meter = IoMeter::new();
        meter.open_log(&path)?;
        meter.charge(
            IoClass::CopyPageToVolume,
            4096,
            IoContext {
                volume_handle: 3,
                page_address: 17,
                journal_address: 99,
                buffer_index: 5,
            },
        );
        meter.charge(IoClass::DeleteJournalFile, 0, IoContext::default());
        meter.close_log()?;
        let bytes = std::fs::read(&path)?;
        assert_eq!(bytes.len(), 2 * IO_LOG_RECORD_SIZE);
        assert_eq!(bytes[0], IoClass::CopyPageToVolume as u8);
        assert_eq!(&bytes[13..21], &17u64.to_le_bytes());
        Ok(())
    }
}
