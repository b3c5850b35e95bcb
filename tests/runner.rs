use std::path::Path;
use std::process::{Command, Output};

use pcat_snapshot::StateBuf;

// mov al,'o'; out 0xe9,al; mov al,'k'; out 0xe9,al; hlt
const HELLO: &[u8] = &[0xB0, b'o', 0xE6, 0xE9, 0xB0, b'k', 0xE6, 0xE9, 0xF4];

fn run(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pcat"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run pcat")
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("temp path should be UTF-8")
}

#[test]
fn runs_image_and_echoes_debugcon() {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("hello.bin");
    std::fs::write(&image, HELLO).unwrap();

    for model in ["286", "386"] {
        let output = run(&["--image", path_str(&image), "--model", model, "--max-insts", "1000"]);
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(output.status.success(), "{model}: {stderr}");
        assert_eq!(output.stdout, b"ok", "{model}");
        assert!(stderr.contains("guest halted after 6 instructions"), "{stderr}");
        assert!(stderr.contains("CS=0000"), "{stderr}");
    }
}

#[test]
fn saves_all_state_sections() {
    let tmp = tempfile::tempdir().unwrap();
    let image = tmp.path().join("hello.bin");
    let state = tmp.path().join("hello.state");
    std::fs::write(&image, HELLO).unwrap();

    let output = run(&[
        "--image",
        path_str(&image),
        "--load-addr",
        "0x1000",
        "--max-insts",
        "3",
        "--save-state",
        path_str(&state),
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    // Stopped after the first OUT.
    assert_eq!(output.stdout, b"o");

    let buf = StateBuf::load_file(&state).unwrap();
    let mut names: Vec<&str> = buf.names().collect();
    names.sort_unstable();
    assert_eq!(names, ["CPUBus", "CPUCore", "Memory"]);

    let output = run(&["--load-state", path_str(&state), "--max-insts", "100"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(output.stdout, b"k");
}

#[test]
fn rejects_unreachable_load_address() {
    let output = run(&["--load-addr", "0x100000", "--max-insts", "1"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not reachable from real mode"));
}
