use std::path::Path;

use anyhow::Result;

use gates::store::WaiverRepository;
use policy_loader::{load_policy_uncached, LoadedPolicy};

pub mod audit;
pub mod budget;
pub mod policy;
pub mod waiver;

/// Load the tier policy for a project, warning on stderr when the built-in
/// defaults are standing in for a missing file.
pub(crate) fn load_policy(project_root: &Path) -> Result<LoadedPolicy> {
    let loaded = load_policy_uncached(project_root)?;
    if loaded.synthetic {
        eprintln!(
            "warning: no policy file under '{}'; built-in defaults are in use",
            project_root.display()
        );
    }
    Ok(loaded)
}

pub(crate) fn open_repository(
    project_root: &Path,
    loaded: &LoadedPolicy,
) -> Result<WaiverRepository> {
    let repo = WaiverRepository::open(project_root)?
        .with_approval_policy(loaded.document.waiver_approval.clone());
    Ok(repo)
}
