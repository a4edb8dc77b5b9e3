use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{CleanerError, Result};
use crate::platform::{FileSystem, RandomSource};

const CHUNK_SIZE: usize = 4096;

/// Overwrite the first `size` bytes of `path` with random data, `passes`
/// times, syncing after each pass. Best effort only: copy-on-write,
/// journaled and remapped storage may keep the old blocks.
pub(crate) fn overwrite(
    fs: &dyn FileSystem,
    random: &dyn RandomSource,
    path: &Path,
    size: u64,
    passes: u32,
) -> Result<()> {
    let io_err = |err| CleanerError::io(err, path);
    let mut handle = fs.open_write(path).map_err(io_err)?;
    let mut buf = [0u8; CHUNK_SIZE];

    for pass in 0..passes.max(1) {
        if pass > 0 {
            handle.seek(SeekFrom::Start(0)).map_err(io_err)?;
        }
        let mut remaining = size;
        while remaining > 0 {
            random.fill(&mut buf);
            let n = remaining.min(CHUNK_SIZE as u64) as usize;
            handle.write_all(&buf[..n]).map_err(io_err)?;
            remaining -= n as u64;
        }
        handle.sync_all().map_err(io_err)?;
    }
    Ok(())
}
