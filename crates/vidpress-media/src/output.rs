// crates/vidpress-media/src/output.rs
//
// Temporary output file for one compress() call.
//
// The muxer writes into `<uuid>.partial.mp4`; only a finished, trailer-
// written file is renamed to `<uuid>.mp4`. Dropping the guard without
// committing removes the partial file, so a cancelled or failed run leaves
// nothing behind in the temp directory.

use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

pub(crate) struct OutputGuard {
    part_path:  PathBuf,
    final_path: PathBuf,
    committed:  bool,
}

impl OutputGuard {
    /// Reserve a fresh name in `dir`. Creates `dir` if it is missing.
    pub fn create(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let stem = Uuid::new_v4();
        Ok(Self {
            part_path:  dir.join(format!("{stem}.partial.mp4")),
            final_path: dir.join(format!("{stem}.mp4")),
            committed:  false,
        })
    }

    /// Where the muxer should write.
    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    #[cfg(test)]
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Move the finished file into place and hand its path to the caller.
    pub fn commit(mut self) -> io::Result<PathBuf> {
        std::fs::rename(&self.part_path, &self.final_path)?;
        self.committed = true;
        Ok(self.final_path.clone())
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.part_path) {
            Ok(()) => log::debug!("[output] removed partial {}", self.part_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("[output] could not remove {}: {e}", self.part_path.display()),
        }
    }
}
