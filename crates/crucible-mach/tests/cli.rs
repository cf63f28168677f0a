//! End-to-end pipe protocol test: plan in on stdin, result plan on stdout,
//! events on stderr.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Stdio};

use crucible_mach::event::{replay, Event, NullObserver};
use crucible_mach::stdio::{read_plan, write_plan_gz};
use crucible_plan::{Backend, Machine, Plan, Stage, Status, Subject};
use crucible_recipe::{FileKind, Instruction, Recipe};

/// A stand-in compiler: whatever `-o` names becomes a shell script that
/// prints a fixed observation, so the run stage has something to execute.
fn write_fake_cc(dir: &Path) -> String {
    let path = dir.join("fake-cc.sh");
    let script = concat!(
        "#!/bin/sh\n",
        "out=\"\"\n",
        "while [ $# -gt 0 ]; do\n",
        "  if [ \"$1\" = -o ]; then shift; out=\"$1\"; fi\n",
        "  shift\n",
        "done\n",
        "cat > \"$out\" <<'EOF'\n",
        "#!/bin/sh\n",
        "echo '{\"flags\":[],\"states\":[]}'\n",
        "EOF\n",
        "chmod +x \"$out\"\n",
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

fn sample_plan(root: &Path) -> Plan {
    let machine = Machine {
        id: "localhost".to_string(),
    };
    let mut plan = Plan::new(machine, Backend::default(), 42, root.to_path_buf());

    let src = root.join("sub_0");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("main.c"), "int main(void){return 0;}").unwrap();

    let recipe = Recipe {
        dir: src.clone(),
        inputs: vec!["main.c".to_string()],
        output: src.join("a.out"),
        instructions: vec![
            Instruction::PushInputs {
                kind: FileKind::CSource,
            },
            Instruction::CompileExe { npop: 0 },
        ],
    };
    let mut subject = Subject::default();
    subject.recipes.insert("x86.64".to_string(), recipe);
    plan.corpus.insert("sub_0".to_string(), subject);

    plan.compilers.insert(
        "cc1".to_string(),
        crucible_plan::Compiler {
            arch: "x86.64".to_string(),
            argv: vec![write_fake_cc(root)],
        },
    );
    plan
}

#[test]
fn gzipped_plan_in_result_plan_and_events_out() {
    let tmp = tempfile::tempdir().unwrap();
    let plan = sample_plan(tmp.path());

    let mut encoded = Vec::new();
    write_plan_gz(&mut encoded, &plan).unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_crucible-mach"))
        .arg("--out-dir")
        .arg(tmp.path().join("out"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    child.stdin.take().unwrap().write_all(&encoded).unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let result = read_plan(&output.stdout[..]).unwrap();
    assert_eq!(result.machine.id, plan.machine.id);
    assert_eq!(result.metadata.created_unix_ms, plan.metadata.created_unix_ms);
    assert!(result.stage_completed(Stage::Compile));
    assert!(result.stage_completed(Stage::Run));

    let compilation = &result.corpus.get("sub_0").unwrap().compilations["cc1"];
    assert_eq!(compilation.compile.as_ref().unwrap().status, Status::Ok);
    assert_eq!(compilation.run.as_ref().unwrap().status, Status::Ok);

    let events = replay(&output.stderr[..], &[&NullObserver]).unwrap();
    assert!(events.contains(&Event::BatchEnd {
        stage: Stage::Compile
    }));
    assert!(events.contains(&Event::BatchEnd { stage: Stage::Run }));
}

#[test]
fn garbage_stdin_exits_nonzero() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_crucible-mach"))
        .arg("--out-dir")
        .arg("/tmp")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(b"not a plan").unwrap();
    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(2));
}
