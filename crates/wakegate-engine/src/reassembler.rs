//! Resumable, duplicate-safe image reassembly on top of the durable chunk
//! buffer tables.
//!
//! One `receiving` buffer exists per (device, image name). A device that
//! power-cycles mid-transfer and announces the same image again resumes that
//! buffer instead of starting over.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};

use wakegate_core::ids::{BufferId, DeviceId, WakeCycleId};
use wakegate_core::state::BufferStatus;
use wakegate_core::ProtocolError;
use wakegate_store::chunk_buffers::{ChunkBufferRepo, ChunkBufferRow};
use wakegate_store::Database;

use crate::error::Result;

/// JPEG start-of-image marker.
const JPEG_SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferHandle {
    pub id: BufferId,
    pub wake_id: Option<WakeCycleId>,
    pub image_name: String,
    pub total: u32,
    pub image_size: Option<u64>,
    /// True when an existing buffer was picked up again.
    pub resumed: bool,
}

impl BufferHandle {
    fn from_row(row: &ChunkBufferRow, resumed: bool) -> Self {
        Self {
            id: row.id.clone(),
            wake_id: row.wake_id.clone(),
            image_name: row.image_name.clone(),
            total: row.total_chunks,
            image_size: row.image_size,
            resumed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkAccepted {
    /// False for a duplicate index; duplicates are still a success.
    pub accepted: bool,
    pub received: u32,
    pub total: u32,
}

impl ChunkAccepted {
    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }
}

#[derive(Clone, Debug)]
pub struct Finalized {
    pub bytes: Vec<u8>,
    /// Reason the structural check failed, if it did.
    pub invalid_reason: Option<String>,
}

impl Finalized {
    pub fn is_valid(&self) -> bool {
        self.invalid_reason.is_none()
    }
}

/// Structural checks on an assembled image.
pub fn validate_image(bytes: &[u8], declared_size: Option<u64>) -> std::result::Result<(), String> {
    if bytes.len() < JPEG_SOI.len() || bytes[..JPEG_SOI.len()] != JPEG_SOI {
        return Err("missing JPEG start-of-image marker".to_string());
    }
    if let Some(expected) = declared_size {
        if bytes.len() as u64 != expected {
            return Err(format!("assembled {} bytes, metadata declared {expected}", bytes.len()));
        }
    }
    Ok(())
}

pub struct ChunkReassembler {
    buffers: ChunkBufferRepo,
    ttl: Duration,
}

impl ChunkReassembler {
    pub fn new(db: Database, ttl: Duration) -> Self {
        Self {
            buffers: ChunkBufferRepo::new(db),
            ttl,
        }
    }

    /// Open a buffer for `image_name`, or resume the one already receiving.
    /// A resumed buffer whose chunk count disagrees with the new metadata is
    /// failed and replaced.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self), fields(device_id = %device_id, wake_id = %wake_id))]
    pub fn begin_or_resume(
        &self,
        device_id: &DeviceId,
        wake_id: &WakeCycleId,
        image_name: &str,
        total: u32,
        image_size: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<BufferHandle> {
        let expires_at = now + self.ttl;
        let (row, resumed) =
            self.buffers
                .begin_or_resume(device_id, wake_id, image_name, total, image_size, now, expires_at)?;
        if resumed && row.total_chunks != total {
            warn!(
                image_name,
                stored_total = row.total_chunks,
                total,
                "chunk count changed on resume, restarting transfer"
            );
            self.close(&row.id, BufferStatus::Failed, Some("chunk count changed"), now)?;
            let (fresh, _) = self.buffers.begin_or_resume(
                device_id, wake_id, image_name, total, image_size, now, expires_at,
            )?;
            return Ok(BufferHandle::from_row(&fresh, false));
        }
        if resumed {
            info!(image_name, received = row.received_count, total, "resuming chunk buffer");
        }
        Ok(BufferHandle::from_row(&row, resumed))
    }

    pub fn find_open(&self, device_id: &DeviceId, image_name: &str) -> Result<Option<BufferHandle>> {
        Ok(self
            .buffers
            .find_open(device_id, image_name)?
            .map(|row| BufferHandle::from_row(&row, true)))
    }

    /// Other images this device still has buffers open for.
    pub fn open_images(&self, device_id: &DeviceId) -> Result<Vec<String>> {
        Ok(self
            .buffers
            .list_open_for_device(device_id)?
            .into_iter()
            .map(|row| row.image_name)
            .collect())
    }

    #[instrument(skip(self, handle, bytes), fields(buffer_id = %handle.id, index))]
    pub fn accept_chunk(
        &self,
        handle: &BufferHandle,
        index: u32,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> Result<ChunkAccepted> {
        if index >= handle.total {
            return Err(ProtocolError::ChunkOutOfRange {
                image_name: handle.image_name.clone(),
                index,
                total: handle.total,
            }
            .into());
        }
        let stored = self.buffers.store_chunk(&handle.id, index, bytes, now, now + self.ttl)?;
        if !stored.newly_stored {
            debug!(index, "duplicate chunk ignored");
        }
        Ok(ChunkAccepted {
            accepted: stored.newly_stored,
            received: stored.received,
            total: stored.total,
        })
    }

    pub fn is_complete(&self, handle: &BufferHandle) -> Result<bool> {
        Ok(self.buffers.get(&handle.id)?.is_complete())
    }

    /// Every index not yet received.
    pub fn missing(&self, handle: &BufferHandle) -> Result<Vec<u32>> {
        let received = self.buffers.received_indices(&handle.id)?;
        Ok(missing_from(&received, handle.total))
    }

    /// Gaps below the highest received index; indices past it are presumed
    /// still in flight.
    pub fn gaps(&self, handle: &BufferHandle) -> Result<Vec<u32>> {
        let received = self.buffers.received_indices(&handle.id)?;
        let Some(&highest) = received.last() else {
            return Ok(Vec::new());
        };
        Ok(missing_from(&received, highest))
    }

    /// Concatenate parts in index order and run the structural checks. The
    /// buffer stays open; the caller decides how to close it.
    #[instrument(skip(self, handle), fields(buffer_id = %handle.id))]
    pub fn finalize(&self, handle: &BufferHandle) -> Result<Finalized> {
        let bytes = self.buffers.assemble(&handle.id)?;
        let invalid_reason = validate_image(&bytes, handle.image_size).err();
        if let Some(reason) = &invalid_reason {
            warn!(image_name = %handle.image_name, %reason, "image failed validation");
        }
        Ok(Finalized { bytes, invalid_reason })
    }

    /// Close the buffer and drop its parts. Returns false when it was already
    /// closed.
    pub fn close(
        &self,
        id: &BufferId,
        status: BufferStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let closed = self.buffers.close(id, status, reason, now)?;
        if closed {
            self.buffers.purge_parts(id)?;
        }
        Ok(closed)
    }

    /// Receiving buffers whose expiry has passed.
    pub fn expired(&self, now: DateTime<Utc>) -> Result<Vec<ChunkBufferRow>> {
        Ok(self.buffers.list_expired(now)?)
    }

    pub fn for_wake(&self, wake_id: &WakeCycleId) -> Result<Vec<ChunkBufferRow>> {
        Ok(self.buffers.list_for_wake(wake_id)?)
    }
}

fn missing_from(received: &[u32], upper: u32) -> Vec<u32> {
    let mut it = received.iter().peekable();
    (0..upper)
        .filter(|i| {
            while it.peek().is_some_and(|r| **r < *i) {
                it.next();
            }
            it.peek() != Some(&i)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use wakegate_store::devices::DeviceRepo;

    fn setup() -> (ChunkReassembler, DeviceId) {
        let db = Database::in_memory().unwrap();
        let dev = DeviceRepo::new(db.clone()).get_or_provision("AA:BB", Utc::now()).unwrap();
        (ChunkReassembler::new(db, Duration::seconds(120)), dev.id)
    }

    fn jpeg_parts() -> Vec<Vec<u8>> {
        vec![vec![0xFF, 0xD8, 0xFF, 0xE0], vec![1, 2, 3], vec![0xFF, 0xD9]]
    }

    #[test]
    fn validate_checks_marker_and_size() {
        assert!(validate_image(&[0xFF, 0xD8, 0xFF, 0x00], None).is_ok());
        assert!(validate_image(&[0xFF, 0xD8, 0xFF, 0x00], Some(4)).is_ok());
        assert!(validate_image(&[0xFF, 0xD8, 0xFF, 0x00], Some(5)).is_err());
        assert!(validate_image(b"GIF89a", None).is_err());
        assert!(validate_image(&[], None).is_err());
    }

    #[test]
    fn missing_from_sorted_indices() {
        assert_eq!(missing_from(&[0, 2], 3), vec![1]);
        assert_eq!(missing_from(&[], 3), vec![0, 1, 2]);
        assert_eq!(missing_from(&[0, 1, 2], 3), Vec::<u32>::new());
        assert_eq!(missing_from(&[1, 4], 4), vec![0, 2, 3]);
    }

    #[test]
    fn duplicate_chunk_is_idempotent() {
        let (r, dev) = setup();
        let now = Utc::now();
        let h = r.begin_or_resume(&dev, &WakeCycleId::new(), "a.jpg", 3, None, now).unwrap();
        let first = r.accept_chunk(&h, 0, b"x", now).unwrap();
        let again = r.accept_chunk(&h, 0, b"x", now).unwrap();
        assert!(first.accepted);
        assert!(!again.accepted);
        assert_eq!(again.received, 1);
    }

    #[test]
    fn out_of_range_rejected_without_closing() {
        let (r, dev) = setup();
        let now = Utc::now();
        let h = r.begin_or_resume(&dev, &WakeCycleId::new(), "a.jpg", 2, None, now).unwrap();
        let err = r.accept_chunk(&h, 2, b"x", now).unwrap_err();
        assert!(matches!(err, EngineError::Protocol(ProtocolError::ChunkOutOfRange { index: 2, .. })));
        assert!(r.find_open(&dev, "a.jpg").unwrap().is_some());
        assert!(r.accept_chunk(&h, 1, b"x", now).unwrap().accepted);
    }

    #[test]
    fn every_order_completes() {
        let orders: [[u32; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let (r, dev) = setup();
            let now = Utc::now();
            let h = r.begin_or_resume(&dev, &WakeCycleId::new(), "a.jpg", 3, None, now).unwrap();
            let parts = jpeg_parts();
            for i in order {
                r.accept_chunk(&h, i, &parts[i as usize], now).unwrap();
            }
            assert!(r.is_complete(&h).unwrap(), "order {order:?}");
            let done = r.finalize(&h).unwrap();
            assert!(done.is_valid());
            assert_eq!(done.bytes, parts.concat());
        }
    }

    #[test]
    fn resume_keeps_received_chunks() {
        let (r, dev) = setup();
        let now = Utc::now();
        let h = r.begin_or_resume(&dev, &WakeCycleId::new(), "a.jpg", 3, None, now).unwrap();
        r.accept_chunk(&h, 0, b"x", now).unwrap();
        r.accept_chunk(&h, 2, b"z", now).unwrap();
        assert_eq!(r.gaps(&h).unwrap(), vec![1]);

        let again = r.begin_or_resume(&dev, &WakeCycleId::new(), "a.jpg", 3, None, now).unwrap();
        assert!(again.resumed);
        assert_eq!(again.id, h.id);
        assert_eq!(r.missing(&again).unwrap(), vec![1]);
    }

    #[test]
    fn resume_with_new_total_restarts() {
        let (r, dev) = setup();
        let now = Utc::now();
        let h = r.begin_or_resume(&dev, &WakeCycleId::new(), "a.jpg", 3, None, now).unwrap();
        r.accept_chunk(&h, 0, b"x", now).unwrap();
        let fresh = r.begin_or_resume(&dev, &WakeCycleId::new(), "a.jpg", 5, None, now).unwrap();
        assert!(!fresh.resumed);
        assert_ne!(fresh.id, h.id);
        assert_eq!(fresh.total, 5);
        assert_eq!(r.missing(&fresh).unwrap().len(), 5);
    }

    #[test]
    fn invalid_image_reported_not_thrown() {
        let (r, dev) = setup();
        let now = Utc::now();
        let h = r.begin_or_resume(&dev, &WakeCycleId::new(), "a.jpg", 1, None, now).unwrap();
        r.accept_chunk(&h, 0, b"not a jpeg", now).unwrap();
        let done = r.finalize(&h).unwrap();
        assert!(!done.is_valid());
        assert!(r.close(&h.id, BufferStatus::Failed, done.invalid_reason.as_deref(), now).unwrap());
        assert!(!r.close(&h.id, BufferStatus::Failed, None, now).unwrap());
        assert!(r.find_open(&dev, "a.jpg").unwrap().is_none());
    }
}
