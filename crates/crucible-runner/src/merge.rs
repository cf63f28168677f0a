//! Folding a remote result plan back into the local plan, and the file
//! mappings the transports copy in each direction.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

use crucible_plan::{FileOrigin, Plan};

/// Merges `remote` (the plan returned by the machine phase) into `local`
/// (the plan that was sent). Stage history and per-subject compilations are
/// taken from the remote side; remote paths are rebased into the local run
/// root. Every local subject must come back, or something went wrong in
/// transit and the merge fails.
pub fn merge_plans(mut local: Plan, mut remote: Plan) -> Result<Plan> {
    remote
        .rebase(&local.run_root)
        .context("rebasing remote plan")?;

    local.metadata.stages = remote.metadata.stages.clone();
    local.quantities = remote.quantities;

    for (name, subject) in local.corpus.iter_mut() {
        let remote_subject = remote
            .corpus
            .get(name)
            .with_context(|| format!("subject {name} missing from remote corpus"))?;
        subject.compilations = remote_subject.compilations.clone();
    }
    Ok(local)
}

/// Files to pull back after a merge, keyed destination (local path) to
/// source (the same file under `remote_root`). Only compile products that
/// are not sources come back; inputs were shipped out in the first place.
pub fn retrieval_mappings(
    plan: &Plan,
    remote_root: &Path,
) -> Result<BTreeMap<PathBuf, PathBuf>> {
    let mut mappings = BTreeMap::new();
    for (name, subject) in plan.corpus.iter() {
        for compilation in subject.compilations.values() {
            let Some(compile) = &compilation.compile else {
                continue;
            };
            for file in &compile.files {
                if file.origin != FileOrigin::Compile || file.kind.is_source() {
                    continue;
                }
                let rel = file.path.strip_prefix(&plan.run_root).with_context(|| {
                    format!("subject {name}: {} is outside the run root", file.path.display())
                })?;
                mappings.insert(file.path.clone(), remote_root.join(rel));
            }
        }
    }
    Ok(mappings)
}

/// Files to ship before starting a remote machine phase, keyed destination
/// (path under `remote_root`) to source (local path): every recipe input of
/// every subject.
pub fn source_mappings(plan: &Plan, remote_root: &Path) -> Result<BTreeMap<PathBuf, PathBuf>> {
    let mut mappings = BTreeMap::new();
    for (name, subject) in plan.corpus.iter() {
        for recipe in subject.recipes.values() {
            for src in recipe.input_paths() {
                let rel = src.strip_prefix(&plan.run_root).with_context(|| {
                    format!("subject {name}: {} is outside the run root", src.display())
                })?;
                mappings.insert(remote_root.join(rel), src);
            }
        }
    }
    Ok(mappings)
}

/// Streaming SHA-256 of a file, in the `sha256:<hex>` form recorded on
/// file records.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("opening {} to digest", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 << 10];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// Records a digest on every retrieved compile product, verifying along the
/// way that each one actually landed on local disk.
pub fn record_digests(plan: &mut Plan) -> Result<()> {
    for (name, subject) in plan.corpus.iter_mut() {
        for compilation in subject.compilations.values_mut() {
            let Some(compile) = compilation.compile.as_mut() else {
                continue;
            };
            for file in &mut compile.files {
                if file.origin != FileOrigin::Compile || file.kind.is_source() {
                    continue;
                }
                if !file.path.exists() {
                    bail!(
                        "subject {name}: retrieved file {} does not exist",
                        file.path.display()
                    );
                }
                file.sha256 = Some(digest_file(&file.path)?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crucible_plan::{
        now_unix_ms, Backend, CompileResult, FileOrigin, FileRecord, Machine, Stage, Status,
        Subject,
    };
    use crucible_recipe::FileKind;

    fn plan(root: &str, subjects: &[&str]) -> Plan {
        let machine = Machine {
            id: "box0".to_string(),
        };
        let mut plan = Plan::new(machine, Backend::default(), 9, PathBuf::from(root));
        for name in subjects {
            plan.corpus.insert(name.to_string(), Subject::default());
        }
        plan
    }

    fn compile_with_bin(path: PathBuf) -> CompileResult {
        CompileResult {
            status: Status::Ok,
            start_unix_ms: now_unix_ms(),
            duration_ms: 1,
            files: vec![FileRecord {
                path,
                kind: FileKind::Binary,
                origin: FileOrigin::Compile,
                sha256: None,
            }],
            stderr_b64: String::new(),
        }
    }

    #[test]
    fn merge_takes_remote_compilations_and_rebases() {
        let local = plan("/local/run", &["a"]);
        let mut remote = plan("/remote/run", &["a"]);
        remote.stamp_stage(Stage::Compile);
        remote
            .corpus
            .get_mut("a")
            .unwrap()
            .compilations
            .entry("cc1".to_string())
            .or_default()
            .compile = Some(compile_with_bin(PathBuf::from("/remote/run/out/a/cc1/a.out")));

        let merged = merge_plans(local, remote).unwrap();
        assert!(merged.stage_completed(Stage::Compile));
        let compile = merged.corpus.get("a").unwrap().compilations["cc1"]
            .compile
            .as_ref()
            .unwrap();
        assert_eq!(
            compile.files[0].path,
            PathBuf::from("/local/run/out/a/cc1/a.out")
        );
        assert_eq!(merged.run_root, PathBuf::from("/local/run"));
    }

    #[test]
    fn merge_fails_when_remote_lost_a_subject() {
        let local = plan("/local/run", &["a", "b"]);
        let remote = plan("/remote/run", &["a"]);
        let err = merge_plans(local, remote).unwrap_err();
        assert!(format!("{err:#}").contains("subject b missing"));
    }

    #[test]
    fn retrieval_skips_sources_and_input_files() {
        let mut plan = plan("/local/run", &["a"]);
        let compile = CompileResult {
            files: vec![
                FileRecord {
                    path: PathBuf::from("/local/run/out/a/cc1/a.out"),
                    kind: FileKind::Binary,
                    origin: FileOrigin::Compile,
                    sha256: None,
                },
                FileRecord {
                    path: PathBuf::from("/local/run/out/a/cc1/compile.log"),
                    kind: FileKind::Log,
                    origin: FileOrigin::Compile,
                    sha256: None,
                },
                FileRecord {
                    path: PathBuf::from("/local/run/a/main.c"),
                    kind: FileKind::CSource,
                    origin: FileOrigin::Compile,
                    sha256: None,
                },
                FileRecord {
                    path: PathBuf::from("/local/run/a/input.bin"),
                    kind: FileKind::Binary,
                    origin: FileOrigin::Input,
                    sha256: None,
                },
            ],
            ..compile_with_bin(PathBuf::from("/unused"))
        };
        plan.corpus
            .get_mut("a")
            .unwrap()
            .compilations
            .entry("cc1".to_string())
            .or_default()
            .compile = Some(compile);

        let mappings = retrieval_mappings(&plan, Path::new("/remote/run")).unwrap();
        let dsts: Vec<_> = mappings.keys().cloned().collect();
        assert_eq!(
            dsts,
            vec![
                PathBuf::from("/local/run/out/a/cc1/a.out"),
                PathBuf::from("/local/run/out/a/cc1/compile.log"),
            ]
        );
        assert_eq!(
            mappings[&PathBuf::from("/local/run/out/a/cc1/a.out")],
            PathBuf::from("/remote/run/out/a/cc1/a.out")
        );
    }

    #[test]
    fn digest_has_expected_form() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("bin");
        std::fs::write(&file, b"hello").unwrap();
        let digest = digest_file(&file).unwrap();
        assert_eq!(
            digest,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
