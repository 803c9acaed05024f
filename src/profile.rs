//! Named base configurations
//!
//! A profile is a MeshControlPlane, or a bare spec, stored as
//! `<dir>/<name>.yaml`. Every profile other than `default` only states what
//! it changes, so it is read as an overlay on the default profile next to it.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::tree;
use crate::yaml::parse_yaml;
use crate::Error;

/// Profile used when none is named
pub const DEFAULT_PROFILE: &str = "default";

/// Directory under the charts directory holding the profiles
pub const PROFILES_SUBDIR: &str = "profiles";

const PROFILE_SUFFIX: &str = ".yaml";
const DEFAULT_FILE: &str = "default.yaml";

/// Profiles stored as files in one directory
#[derive(Clone, Debug)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    /// Store reading profiles from `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under a charts directory
    pub fn in_charts_dir(charts_dir: &Path) -> Self {
        Self::new(charts_dir.join(PROFILES_SUBDIR))
    }

    /// Spec tree of `profile`, already layered on the default profile.
    ///
    /// `profile` is either a name looked up in the store or a path to a
    /// profile file, whose default profile is then read from the file's own
    /// directory.
    pub async fn load(&self, profile: &str) -> Result<Value, Error> {
        let profile = if profile.is_empty() { DEFAULT_PROFILE } else { profile };
        let path = self.locate(profile);
        let own = read_spec(profile, &path).await?;
        if is_default(profile) {
            return Ok(own);
        }

        let default_path = path.parent().unwrap_or(self.dir.as_path()).join(DEFAULT_FILE);
        let mut layered = read_spec(DEFAULT_PROFILE, &default_path).await?;
        tree::merge(&mut layered, own);
        debug!(profile, path = %path.display(), "loaded profile");
        Ok(layered)
    }

    fn locate(&self, profile: &str) -> PathBuf {
        if looks_like_path(profile) {
            PathBuf::from(profile)
        } else {
            self.dir.join(format!("{profile}{PROFILE_SUFFIX}"))
        }
    }
}

/// Names that select the default profile, by name or by file
fn is_default(profile: &str) -> bool {
    profile.is_empty()
        || profile == DEFAULT_PROFILE
        || Path::new(profile).file_name().and_then(|n| n.to_str()) == Some(DEFAULT_FILE)
}

fn looks_like_path(profile: &str) -> bool {
    profile.contains('/') || profile.ends_with(PROFILE_SUFFIX)
}

/// The spec of a whole resource, or the document itself when it is a bare
/// spec
pub fn spec_of(doc: Value) -> Value {
    match doc {
        Value::Object(mut map) if map.contains_key("kind") && map.contains_key("spec") => {
            map.remove("spec").unwrap_or(Value::Null)
        }
        doc => doc,
    }
}

async fn read_spec(profile: &str, path: &Path) -> Result<Value, Error> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::profile(profile, format!("cannot read {}: {e}", path.display())))?;
    let doc = parse_yaml(&text).map_err(|e| Error::profile(profile, e.to_string()))?;
    match spec_of(doc) {
        Value::Null => Ok(Value::Object(Default::default())),
        spec @ Value::Object(_) => Ok(spec),
        other => Err(Error::profile(
            profile,
            format!("expected a mapping, found a {}", tree::type_name(&other)),
        )),
    }
}
