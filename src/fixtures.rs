//! src/fixtures.rs
//!
//! JSON side-files of a spliced fixtures folder: the identity map
//! (`secret-ids.json`), the follow graph (`follow-graph.json`) and the
//! generated `expectations.json`.

use crate::{
    error::{Error, Result},
    expectations::{ExpectationMap, FollowGraph},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

pub const IDENTITY_MAP_FILE: &str = "secret-ids.json";
pub const FOLLOW_GRAPH_FILE: &str = "follow-graph.json";
pub const EXPECTATIONS_FILE: &str = "expectations.json";
/// Fixture folder whose log holds every historic message.
pub const ALL_OFFSETS_FOLDER: &str = "puppet-all";

/// Where one identity's secret and log live, and its latest sequence number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedInfo {
    pub folder: String,
    pub latest: u64,
}

/// feed id -> fixture info
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityMap(pub BTreeMap<String, FeedInfo>);

impl IdentityMap {
    pub fn load(fixtures_root: &Path) -> Result<Self> {
        let path = fixtures_root.join(IDENTITY_MAP_FILE);
        let bytes = fs::read(&path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Missing identity map; was the fixtures folder spliced?");
            Error::MissingFixtures
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn get(&self, id: &str) -> Result<&FeedInfo> {
        self.0
            .get(id)
            .ok_or_else(|| Error::UnknownFixtureId(id.to_string()))
    }

    /// Folder name -> feed id, the naming the generator emits scripts in.
    pub fn names_to_ids(&self) -> BTreeMap<&str, &str> {
        self.0
            .iter()
            .map(|(id, info)| (info.folder.as_str(), id.as_str()))
            .collect()
    }
}

/// Paths a fixture-backed puppet hands to its shim.
pub struct FixturePaths<'a> {
    pub root: &'a Path,
    pub folder: &'a str,
}

impl FixturePaths<'_> {
    pub fn secret(&self) -> PathBuf {
        self.root.join(self.folder).join("secret")
    }

    pub fn log_offset(&self, all_offsets: bool) -> PathBuf {
        let folder = if all_offsets { ALL_OFFSETS_FOLDER } else { self.folder };
        self.root.join(folder).join("flume").join("log.offset")
    }
}

pub fn load_follow_graph(path: &Path) -> Result<FollowGraph> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn read_expectations(path: &Path) -> Result<ExpectationMap> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn write_expectations(path: &Path, expectations: &ExpectationMap) -> Result<()> {
    let json = serde_json::to_string_pretty(expectations)?;
    fs::write(path, json)?;
    Ok(())
}

/// A path ending in `json` names a file; its parent directory is used.
pub fn path_and_file(dir: &Path, name: &str) -> PathBuf {
    let is_json = dir
        .to_str()
        .map(|s| s.ends_with("json"))
        .unwrap_or(false);
    match (is_json, dir.parent()) {
        (true, Some(parent)) => parent.join(name),
        _ => dir.join(name),
    }
}
