//! `rtme verify`: Check header consistency and checksums.

use std::io::Write;
use std::path::PathBuf;

/// Report every file; fails when any of them is corrupt
pub fn execute(files: &[PathBuf], out: &mut impl Write) -> anyhow::Result<()> {
    let mut failed = 0;
    for file in files {
        match rtme_format::check_integrity(file) {
            Ok(()) => writeln!(out, "OK      {}", file.display())?,
            Err(e) => {
                failed += 1;
                writeln!(out, "FAILED  {}: {}", file.display(), e)?;
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} files failed verification", failed, files.len());
    }
    Ok(())
}
