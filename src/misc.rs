// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::Path;

use anyhow::{bail, Result};

/// Read a small pseudo-file into a trimmed string.
pub fn read_trimmed(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(val) => Ok(val.trim().to_string()),
        Err(_) => bail!("failed to open or read file {:?}", path),
    }
}

/// Read a pseudo-file holding a single decimal integer.
pub fn read_usize(path: &Path) -> Result<usize> {
    let val = read_trimmed(path)?;
    match val.parse::<usize>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => bail!("failed to parse {:?} from {:?}", val, path),
    }
}

/// Read a pseudo-file holding a single, possibly negative, decimal integer.
pub fn read_i32(path: &Path) -> Result<i32> {
    let val = read_trimmed(path)?;
    match val.parse::<i32>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => bail!("failed to parse {:?} from {:?}", val, path),
    }
}
