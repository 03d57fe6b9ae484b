// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::PathBuf;
use std::result;

use option_parser::{OptionParser, OptionParserError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SNAPSHOT_PATH: &str = "/dev/shm/snapshot0";
pub const DEFAULT_SHARED_PATH: &str = "/dev/shm/snapshot_data";

/// Errors associated with snapshot configuration parameters.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Error parsing --snapshot: {0}")]
    ParseSnapshot(#[source] OptionParserError),
    #[error("Snapshot image and shared memory file must be different files: {0}")]
    SamePath(PathBuf),
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SnapshotConfig {
    /// Flat file holding the saved guest RAM image.
    pub snapshot_path: PathBuf,
    /// One page file mapped into the guest as the shared window.
    pub shared_path: PathBuf,
}

impl SnapshotConfig {
    pub const SYNTAX: &'static str = "Snapshot parameters \
        \"snapshot=<guest_ram_image_path>,shared=<shared_memory_file_path>\"";

    pub fn parse(snapshot: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("snapshot").add("shared");
        parser.parse(snapshot).map_err(Error::ParseSnapshot)?;

        let snapshot_path = PathBuf::from(
            parser
                .get("snapshot")
                .unwrap_or_else(|| DEFAULT_SNAPSHOT_PATH.to_owned()),
        );
        let shared_path = PathBuf::from(
            parser
                .get("shared")
                .unwrap_or_else(|| DEFAULT_SHARED_PATH.to_owned()),
        );

        let config = SnapshotConfig {
            snapshot_path,
            shared_path,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot_path == self.shared_path {
            return Err(Error::SamePath(self.snapshot_path.clone()));
        }

        Ok(())
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            shared_path: PathBuf::from(DEFAULT_SHARED_PATH),
        }
    }
}
