//! Chunked dataset transfer.
//!
//! A receiving endpoint gets a transfer id and metadata, allocates a dataset
//! directory and then accepts chunk payloads for either channel in any order.
//! Each payload is written at its fixed offset, so resends are idempotent and
//! a failed chunk only fails that call. Serving reads the same byte ranges
//! back.

mod state;
mod storage;

pub use state::{TransferSnapshot, TransferState, TransferStatus};
pub use storage::{DatasetStorage, FileSystemStorage};

use crate::compression::{decode_chunk, get_compressor, CompressionLevel, CompressionMethod};
use crate::config::{HeaderFormat, TransferConfig};
use crate::error::{Result, VolError};
use crate::format::{self, write_grid_header, LoadOptions, VolumeHeader};
use crate::metadata::TransferMetadata;
use crate::store::{ChunkStore, LabelChunkStore};
use crate::types::{Channel, VolumeInfo};
use bytes::Bytes;
use chrono::Utc;
use futures::future::try_join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct ChunkTransferService {
    storage: Arc<dyn DatasetStorage>,
    transfers: RwLock<HashMap<String, TransferState>>,
    datasets: RwLock<HashMap<String, TransferMetadata>>,
}

impl ChunkTransferService {
    /// Service storing datasets under `config.base_dir`
    pub fn new(config: &TransferConfig) -> Self {
        Self::with_storage(Arc::new(FileSystemStorage::new(&config.base_dir)))
    }

    pub fn with_storage(storage: Arc<dyn DatasetStorage>) -> Self {
        Self {
            storage,
            transfers: RwLock::new(HashMap::new()),
            datasets: RwLock::new(HashMap::new()),
        }
    }

    /// Start receiving a dataset. Returns the generated dataset id.
    ///
    /// `metadata.json` becomes the authoritative shape; `volume.bin` (no
    /// header) and `labels.bin` (grid header) are created at full size
    /// without writing payloads. If any step fails the directory is removed,
    /// the transfer is unregistered and the error is reported as
    /// [`VolError::Allocation`].
    pub async fn initialize_receive(&self, transfer_id: &str, metadata: TransferMetadata) -> Result<String> {
        let layout = metadata.layout()?;
        let dataset_id = Uuid::new_v4().to_string();
        {
            let mut transfers = self.transfers.write();
            if let Some(existing) = transfers.get(transfer_id) {
                if !existing.status.is_terminal() {
                    return Err(VolError::Configuration(format!(
                        "transfer {} is already {}",
                        transfer_id, existing.status
                    )));
                }
            }
            transfers.insert(
                transfer_id.to_string(),
                TransferState::new(
                    transfer_id.to_string(),
                    dataset_id.clone(),
                    layout.total_chunks(),
                    TransferStatus::Initializing,
                ),
            );
        }

        if let Err(err) = self.allocate_dataset(&dataset_id, &metadata).await {
            if let Err(cleanup) = self.storage.remove_dir_all(&dataset_id).await {
                warn!(dataset_id = %dataset_id, error = %cleanup, "rollback of partial dataset failed");
            }
            let err = match err {
                VolError::Allocation(reason) => VolError::Allocation(reason),
                other => VolError::Allocation(format!("dataset {}: {}", dataset_id, other)),
            };
            self.transfers.write().remove(transfer_id);
            warn!(transfer_id, dataset_id = %dataset_id, error = %err, "receive rolled back");
            return Err(err);
        }

        self.datasets.write().insert(dataset_id.clone(), metadata);
        self.set_status(transfer_id, TransferStatus::Receiving);
        info!(
            transfer_id,
            dataset_id = %dataset_id,
            layout = %layout.summary(),
            "receive initialized"
        );
        Ok(dataset_id)
    }

    async fn allocate_dataset(&self, dataset_id: &str, metadata: &TransferMetadata) -> Result<()> {
        let info = metadata.volume_info()?;
        let layout = info.layout;
        let labels = layout.aligned();

        self.storage.create_dir(dataset_id).await?;
        self.storage
            .write_file(&dataset_file(dataset_id, crate::METADATA_FILE), &metadata.to_json()?)
            .await?;
        self.storage
            .allocate(
                &dataset_file(dataset_id, crate::VOLUME_FILE),
                &[],
                layout.raw_data_size(),
            )
            .await?;
        let mut label_header = Vec::with_capacity(format::LABEL_HEADER_SIZE);
        write_grid_header(&mut label_header, &labels)?;
        self.storage
            .allocate(
                &dataset_file(dataset_id, crate::LABELS_FILE),
                &label_header,
                format::LABEL_HEADER_SIZE as u64 + labels.raw_data_size(),
            )
            .await?;
        let sidecar = VolumeHeader::from_info(&info).to_bytes(HeaderFormat::Legacy);
        self.storage
            .write_file(&dataset_file(dataset_id, crate::VOLUME_SIDECAR), &sidecar)
            .await?;
        Ok(())
    }

    pub async fn process_volume_chunk(&self, transfer_id: &str, index: usize, data: &[u8]) -> Result<()> {
        self.process_chunk(transfer_id, Channel::Volume, index, data).await
    }

    pub async fn process_labels_chunk(&self, transfer_id: &str, index: usize, data: &[u8]) -> Result<()> {
        self.process_chunk(transfer_id, Channel::Labels, index, data).await
    }

    /// Write one received chunk. Failures are reported as
    /// [`VolError::ChunkWrite`] and leave the transfer receiving.
    pub async fn process_chunk(
        &self,
        transfer_id: &str,
        channel: Channel,
        index: usize,
        data: &[u8],
    ) -> Result<()> {
        let (dataset_id, total_chunks) = {
            let transfers = self.transfers.read();
            let state = transfers
                .get(transfer_id)
                .ok_or_else(|| VolError::NotFound(format!("transfer {}", transfer_id)))?;
            if state.status != TransferStatus::Receiving {
                return Err(VolError::Configuration(format!(
                    "transfer {} is {}, not receiving",
                    transfer_id, state.status
                )));
            }
            (state.dataset_id.clone(), state.total_chunks)
        };
        let (chunk_size, compression) = {
            let datasets = self.datasets.read();
            let metadata = datasets
                .get(&dataset_id)
                .ok_or_else(|| VolError::NotFound(format!("dataset {}", dataset_id)))?;
            (metadata.chunk_byte_size, metadata.compression)
        };

        let chunk_error = |reason: String| VolError::ChunkWrite { index, reason };
        if index >= total_chunks {
            return Err(chunk_error(format!("index outside 0..{}", total_chunks)));
        }
        let decoded;
        let payload = if compression == CompressionMethod::None {
            data
        } else {
            decoded = decode_chunk(compression, data, chunk_size).map_err(|e| chunk_error(e.to_string()))?;
            &decoded[..]
        };
        if payload.len() != chunk_size {
            return Err(chunk_error(format!(
                "payload is {} bytes, expected {}",
                payload.len(),
                chunk_size
            )));
        }

        let offset = channel.payload_offset() + index as u64 * chunk_size as u64;
        self.storage
            .write_at(&dataset_file(&dataset_id, channel.file_name()), offset, payload)
            .await
            .map_err(|e| chunk_error(e.to_string()))?;

        if let Some(state) = self.transfers.write().get_mut(transfer_id) {
            state.mark_received(channel, index);
        }
        debug!(transfer_id, %channel, index, offset, "chunk written");
        Ok(())
    }

    /// Finish a transfer.
    ///
    /// A receive is flushed (`Processing`) then marked `Completed`. Chunk
    /// counts are not checked; use [`missing_chunks`](Self::missing_chunks)
    /// first when completeness matters.
    pub async fn complete_transfer(&self, transfer_id: &str) -> Result<TransferSnapshot> {
        let (status, dataset_id) = {
            let transfers = self.transfers.read();
            let state = transfers
                .get(transfer_id)
                .ok_or_else(|| VolError::NotFound(format!("transfer {}", transfer_id)))?;
            (state.status, state.dataset_id.clone())
        };

        match status {
            TransferStatus::Receiving => {
                self.set_status(transfer_id, TransferStatus::Processing);
                if let Err(err) = self.finish_receive(&dataset_id).await {
                    self.set_failed(transfer_id, &err);
                    return Err(err);
                }
            }
            TransferStatus::Sending => {}
            other => {
                return Err(VolError::Configuration(format!(
                    "transfer {} cannot complete from {}",
                    transfer_id, other
                )))
            }
        }

        let mut transfers = self.transfers.write();
        let state = transfers
            .get_mut(transfer_id)
            .ok_or_else(|| VolError::NotFound(format!("transfer {}", transfer_id)))?;
        state.status = TransferStatus::Completed;
        state.completed_at = Some(Utc::now());
        let snapshot = state.snapshot();
        if status == TransferStatus::Receiving && snapshot.volume_chunks < snapshot.total_chunks {
            warn!(
                transfer_id,
                received = snapshot.volume_chunks,
                total = snapshot.total_chunks,
                "transfer completed with missing volume chunks"
            );
        }
        info!(transfer_id, dataset_id = %dataset_id, "transfer completed");
        Ok(snapshot)
    }

    async fn finish_receive(&self, dataset_id: &str) -> Result<()> {
        self.storage.sync(&dataset_file(dataset_id, crate::VOLUME_FILE)).await?;
        self.storage.sync(&dataset_file(dataset_id, crate::LABELS_FILE)).await?;
        let metadata = {
            let mut datasets = self.datasets.write();
            datasets.get_mut(dataset_id).map(|metadata| {
                metadata.touch();
                metadata.clone()
            })
        };
        if let Some(metadata) = metadata {
            self.storage
                .write_file(&dataset_file(dataset_id, crate::METADATA_FILE), &metadata.to_json()?)
                .await?;
        }
        Ok(())
    }

    /// Chunk indices of `channel` not received yet, ascending
    pub fn missing_chunks(&self, transfer_id: &str, channel: Channel) -> Result<Vec<usize>> {
        self.transfers
            .read()
            .get(transfer_id)
            .map(|state| state.missing(channel))
            .ok_or_else(|| VolError::NotFound(format!("transfer {}", transfer_id)))
    }

    /// Mark a transfer failed; the dataset directory is left in place
    pub fn fail_transfer(&self, transfer_id: &str, reason: &str) -> Result<()> {
        let mut transfers = self.transfers.write();
        let state = transfers
            .get_mut(transfer_id)
            .ok_or_else(|| VolError::NotFound(format!("transfer {}", transfer_id)))?;
        state.status = TransferStatus::Failed;
        state.error = Some(reason.to_string());
        warn!(transfer_id, reason, "transfer failed");
        Ok(())
    }

    /// Start serving a dataset under `transfer_id`
    pub async fn initialize_send(&self, transfer_id: &str, dataset_id: &str) -> Result<TransferMetadata> {
        let metadata = self.dataset_metadata(dataset_id).await?;
        let mut transfers = self.transfers.write();
        if let Some(existing) = transfers.get(transfer_id) {
            if !existing.status.is_terminal() {
                return Err(VolError::Configuration(format!(
                    "transfer {} is already {}",
                    transfer_id, existing.status
                )));
            }
        }
        transfers.insert(
            transfer_id.to_string(),
            TransferState::new(
                transfer_id.to_string(),
                dataset_id.to_string(),
                metadata.total_chunks,
                TransferStatus::Sending,
            ),
        );
        info!(transfer_id, dataset_id, "send initialized");
        Ok(metadata)
    }

    pub async fn get_volume_chunk(&self, dataset_id: &str, index: usize) -> Result<Bytes> {
        self.get_chunk(dataset_id, Channel::Volume, index).await
    }

    pub async fn get_labels_chunk(&self, dataset_id: &str, index: usize) -> Result<Bytes> {
        self.get_chunk(dataset_id, Channel::Labels, index).await
    }

    /// Read one chunk back, encoded with the dataset's transport compression
    pub async fn get_chunk(&self, dataset_id: &str, channel: Channel, index: usize) -> Result<Bytes> {
        let metadata = self.dataset_metadata(dataset_id).await?;
        if index >= metadata.total_chunks {
            return Err(VolError::OutOfBounds(format!(
                "chunk {} outside 0..{}",
                index, metadata.total_chunks
            )));
        }
        let size = metadata.chunk_byte_size;
        let offset = channel.payload_offset() + index as u64 * size as u64;
        let raw = self
            .storage
            .read_at(&dataset_file(dataset_id, channel.file_name()), offset, size)
            .await?;
        if metadata.compression == CompressionMethod::None {
            return Ok(raw);
        }
        let packed = get_compressor(metadata.compression).compress(&raw, CompressionLevel::default())?;
        Ok(Bytes::from(packed))
    }

    /// Read several chunks concurrently, in the order requested
    pub async fn get_chunks(&self, dataset_id: &str, channel: Channel, indices: &[usize]) -> Result<Vec<Bytes>> {
        try_join_all(
            indices
                .iter()
                .map(|&index| self.get_chunk(dataset_id, channel, index)),
        )
        .await
    }

    /// Snapshot of every tracked transfer, keyed by transfer id
    pub fn active_transfers(&self) -> HashMap<String, TransferSnapshot> {
        self.transfers
            .read()
            .iter()
            .map(|(id, state)| (id.clone(), state.snapshot()))
            .collect()
    }

    /// Forget a transfer. The dataset on disk is kept.
    pub fn cleanup_transfer(&self, transfer_id: &str) -> bool {
        let removed = self.transfers.write().remove(transfer_id).is_some();
        if removed {
            debug!(transfer_id, "transfer entry removed");
        }
        removed
    }

    /// Metadata of a known dataset, read from `metadata.json` if this
    /// process has not seen it yet
    pub async fn dataset_metadata(&self, dataset_id: &str) -> Result<TransferMetadata> {
        Uuid::parse_str(dataset_id)
            .map_err(|_| VolError::NotFound(format!("dataset {}", dataset_id)))?;
        if let Some(metadata) = self.datasets.read().get(dataset_id) {
            return Ok(metadata.clone());
        }
        let bytes = self
            .storage
            .read_file(&dataset_file(dataset_id, crate::METADATA_FILE))
            .await?;
        let metadata = TransferMetadata::from_json(&bytes)?;
        metadata.layout()?;
        self.datasets
            .write()
            .insert(dataset_id.to_string(), metadata.clone());
        Ok(metadata)
    }

    /// Load a received dataset as stores; the shape comes from its metadata
    pub async fn open_dataset(
        &self,
        dataset_id: &str,
        options: &LoadOptions,
    ) -> Result<(ChunkStore, LabelChunkStore, VolumeInfo)> {
        let info = self.dataset_metadata(dataset_id).await?.volume_info()?;
        let volume_path = self
            .storage
            .local_path(&dataset_file(dataset_id, crate::VOLUME_FILE))
            .ok_or_else(|| VolError::Configuration("storage has no local files".to_string()))?;
        let labels_path = self
            .storage
            .local_path(&dataset_file(dataset_id, crate::LABELS_FILE))
            .ok_or_else(|| VolError::Configuration("storage has no local files".to_string()))?;
        let options = options.clone();
        tokio::task::spawn_blocking(move || -> Result<(ChunkStore, LabelChunkStore, VolumeInfo)> {
            let volume = format::load_volume_raw(&volume_path, &info.layout, &options)?;
            let labels = format::load_labels(&labels_path, &options)?;
            Ok((volume, labels, info))
        })
        .await
        .map_err(|e| VolError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    fn set_status(&self, transfer_id: &str, status: TransferStatus) {
        if let Some(state) = self.transfers.write().get_mut(transfer_id) {
            state.status = status;
        }
    }

    fn set_failed(&self, transfer_id: &str, err: &VolError) {
        if let Some(state) = self.transfers.write().get_mut(transfer_id) {
            state.status = TransferStatus::Failed;
            state.error = Some(err.to_string());
        }
        warn!(transfer_id, error = %err, "transfer failed");
    }
}

fn dataset_file(dataset_id: &str, file: &str) -> String {
    format!("{}/{}", dataset_id, file)
}
