use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use byteorder::{BigEndian, WriteBytesExt};

/// Per-session binary trace capture.
///
/// Each record is `[direction:i32][sec:i32][usec:i32][len:i32]` big-endian
/// followed by the frame bytes, appended in arrival order and flushed per
/// record so a crash loses at most the frame in flight. Frames are recorded
/// after decryption, before they are processed or forwarded.
pub struct TraceWriter {
    file: File,
    path: PathBuf,
}

impl TraceWriter {
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create capture directory {}", dir.display()))?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("{stamp}.mcs"));
        let file = File::create(&path)
            .with_context(|| format!("open trace file {}", path.display()))?;
        println!("gateway.trace.opened path={}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, from_client: bool, frame: &[u8]) -> io::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.file.write_i32::<BigEndian>(from_client as i32)?;
        self.file.write_i32::<BigEndian>(now.as_secs() as i32)?;
        self.file.write_i32::<BigEndian>(now.subsec_micros() as i32)?;
        self.file.write_i32::<BigEndian>(frame.len() as i32)?;
        self.file.write_all(frame)?;
        self.file.flush()
    }
}
