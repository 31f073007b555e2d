use super::{AlertRegister, RegisterLayout, RejectionRecord};
use crate::error::RegisterWriteError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Sidecar describing a register's layout and contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterHeader {
    pub layout: RegisterLayout,
    pub block_size: usize,
    pub active: bool,
    pub run_ids: Vec<u32>,
    /// Blocks written across the current file and every rotation
    pub blocks: u64,
    pub rotations: u32,
    pub min_alert_id: Option<u64>,
    pub max_alert_id: Option<u64>,
    pub min_stock: Option<u64>,
    pub max_stock: Option<u64>,
    pub updated_at: String,
}

impl RegisterHeader {
    fn new(layout: RegisterLayout, active: bool) -> Self {
        Self {
            layout,
            block_size: layout.block_size(active),
            active,
            run_ids: Vec::new(),
            blocks: 0,
            rotations: 0,
            min_alert_id: None,
            max_alert_id: None,
            min_stock: None,
            max_stock: None,
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    fn observe(&mut self, record: &RejectionRecord) {
        self.blocks += 1;
        self.min_alert_id = Some(self.min_alert_id.map_or(record.alert_id, |m| m.min(record.alert_id)));
        self.max_alert_id = Some(self.max_alert_id.map_or(record.alert_id, |m| m.max(record.alert_id)));

        if self.layout != RegisterLayout::Minimal {
            let stock = record.stock.0;
            self.min_stock = Some(self.min_stock.map_or(stock, |m| m.min(stock)));
            self.max_stock = Some(self.max_stock.map_or(stock, |m| m.max(stock)));
        }
    }
}

/// Fixed-size block register at `<dir>/<prefix>.bin`
///
/// After `max_blocks` records the file is rotated to `<prefix>.bin.1`,
/// older rotations shifting up by one.
pub struct BinaryAlertRegister {
    file: Option<BufWriter<File>>,
    base_path: PathBuf,
    header_path: PathBuf,
    header: RegisterHeader,
    blocks_in_file: u64,
    max_blocks: u64,
}

impl BinaryAlertRegister {
    pub fn open(
        dir: impl AsRef<Path>,
        prefix: &str,
        layout: RegisterLayout,
        active: bool,
        max_blocks: u64,
        run_id: u32,
    ) -> Result<Self, RegisterWriteError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let base_path = dir.join(format!("{}.bin", prefix));
        let header_path = dir.join(format!("{}.header.json", prefix));

        let mut header = if header_path.exists() {
            let existing: RegisterHeader = serde_json::from_str(&std::fs::read_to_string(&header_path)?)?;
            if existing.layout != layout || existing.active != active {
                return Err(RegisterWriteError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!(
                        "{} was written as {} (active={}), not {} (active={})",
                        base_path.display(),
                        existing.layout,
                        existing.active,
                        layout,
                        active
                    ),
                )));
            }
            existing
        } else {
            RegisterHeader::new(layout, active)
        };
        header.run_ids.push(run_id);

        let file = OpenOptions::new().create(true).append(true).open(&base_path)?;
        let len = file.metadata()?.len();
        let block_size = header.block_size as u64;
        let blocks_in_file = len / block_size;
        if len % block_size != 0 {
            log::warn!(
                "⚠️  {} ends in a torn block ({} stray bytes), truncating to {} blocks",
                base_path.display(),
                len % block_size,
                blocks_in_file
            );
            file.set_len(blocks_in_file * block_size)?;
        }

        log::info!(
            "📂 Rejection register {} ({} layout, {} blocks in file)",
            base_path.display(),
            layout,
            blocks_in_file
        );

        Ok(Self {
            file: Some(BufWriter::new(file)),
            base_path,
            header_path,
            header,
            blocks_in_file,
            max_blocks: max_blocks.max(1),
        })
    }

    pub fn header(&self) -> &RegisterHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.base_path
    }

    fn rotated_path(&self, n: u32) -> PathBuf {
        let mut name = self.base_path.clone().into_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn shift_rotations(&self) -> std::io::Result<()> {
        let mut highest = 0;
        while self.rotated_path(highest + 1).exists() {
            highest += 1;
        }
        for i in (1..=highest).rev() {
            std::fs::rename(self.rotated_path(i), self.rotated_path(i + 1))?;
        }
        std::fs::rename(&self.base_path, self.rotated_path(1))
    }

    fn open_base(&mut self) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&self.base_path)?;
        self.blocks_in_file = file.metadata()?.len() / self.header.block_size as u64;
        self.file = Some(BufWriter::new(file));
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), RegisterWriteError> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }

        // The current writer stays valid until the new base file is open
        if let Err(e) = self.shift_rotations() {
            log::warn!("⚠️  Rotation of {} failed: {}", self.base_path.display(), e);
            if let Err(reopen) = self.open_base() {
                log::warn!("⚠️  Could not reopen {}: {}", self.base_path.display(), reopen);
            }
            return Err(e.into());
        }

        self.open_base()?;
        self.header.rotations += 1;

        log::info!("📄 Rotated rejection register (rotation #{})", self.header.rotations);
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), RegisterWriteError> {
        self.header.updated_at = Utc::now().to_rfc3339();
        let json = serde_json::to_string_pretty(&self.header)?;
        std::fs::write(&self.header_path, json)?;
        Ok(())
    }
}

impl AlertRegister for BinaryAlertRegister {
    fn append(&mut self, record: &RejectionRecord) -> Result<(), RegisterWriteError> {
        if self.file.is_none() {
            return Err(RegisterWriteError::Closed);
        }
        if self.blocks_in_file >= self.max_blocks {
            self.rotate()?;
        }

        let block = record.encode(self.header.layout, self.header.active);
        let file = self.file.as_mut().ok_or(RegisterWriteError::Closed)?;
        file.write_all(&block)?;

        self.blocks_in_file += 1;
        self.header.observe(record);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), RegisterWriteError> {
        let file = self.file.as_mut().ok_or(RegisterWriteError::Closed)?;
        file.flush()?;
        self.write_header()
    }

    fn close(&mut self) -> Result<(), RegisterWriteError> {
        if self.file.is_none() {
            return Ok(());
        }
        self.flush()?;
        self.file = None;

        log::info!(
            "✅ Closed rejection register ({} blocks, {} rotations)",
            self.header.blocks,
            self.header.rotations
        );
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "binary"
    }
}

impl Drop for BinaryAlertRegister {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("⚠️  Failed to close rejection register: {}", e);
        }
    }
}

/// Decodes every block of one register file
pub fn read_blocks(
    path: impl AsRef<Path>,
    layout: RegisterLayout,
    active: bool,
) -> std::io::Result<Vec<RejectionRecord>> {
    let bytes = std::fs::read(path.as_ref())?;
    let size = layout.block_size(active);

    if bytes.len() % size != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "{} is {} bytes, not a multiple of the {}-byte block",
                path.as_ref().display(),
                bytes.len(),
                size
            ),
        ));
    }

    bytes
        .chunks_exact(size)
        .map(|block| {
            RejectionRecord::decode(block, layout, active).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "undecodable block")
            })
        })
        .collect()
}
