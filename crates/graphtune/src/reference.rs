//! Reference files: the only state that survives a session.
//!
//! One record per line, `key|entity[|gflops|elapsed_ms]`. Fields beyond the
//! first two are optional on read.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::graph::SubgraphKey;
use crate::schedule::ScheduleEntity;

#[derive(Debug, Clone)]
pub struct ReferenceRecord {
    pub key: SubgraphKey,
    pub entity: ScheduleEntity,
    pub gflops: Option<f64>,
    pub elapsed_ms: Option<f64>,
}

impl fmt::Display for ReferenceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.key, self.entity)?;
        if let Some(gflops) = self.gflops {
            write!(f, "|{gflops}")?;
        }
        if let Some(elapsed) = self.elapsed_ms {
            write!(f, "|{elapsed}")?;
        }
        Ok(())
    }
}

impl FromStr for ReferenceRecord {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut parts = line.split('|');
        let key = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::bad_config(format!("bad reference line: {line:?}")))?;
        let key = key
            .trim()
            .parse::<u32>()
            .map(SubgraphKey)
            .map_err(|_| Error::bad_config(format!("bad subgraph key in line: {line:?}")))?;
        let entity = parts
            .next()
            .ok_or_else(|| Error::bad_config(format!("bad reference line: {line:?}")))?;
        let entity = ScheduleEntity::new(entity)?;
        let gflops = parts.next().and_then(|p| p.trim().parse::<f64>().ok());
        let elapsed_ms = parts.next().and_then(|p| p.trim().parse::<f64>().ok());
        Ok(ReferenceRecord {
            key,
            entity,
            gflops,
            elapsed_ms,
        })
    }
}

/// Reads every record from `path`, skipping blank lines.
pub fn load_records(path: impl AsRef<Path>) -> Result<Vec<ReferenceRecord>> {
    let contents = fs::read_to_string(path.as_ref())?;
    let mut records = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        records.push(line.parse()?);
    }
    Ok(records)
}

/// Writes `records` to `path`, one line each, truncating any previous file.
pub fn save_records(path: impl AsRef<Path>, records: &[ReferenceRecord]) -> Result<()> {
    let mut file = fs::File::create(path.as_ref())?;
    for record in records {
        writeln!(file, "{record}")?;
    }
    Ok(())
}
