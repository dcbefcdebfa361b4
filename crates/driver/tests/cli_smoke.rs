use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs::File;
use std::io::Write;
use std::process::Command;
use tempfile::tempdir;

fn rtmcc() -> Command {
    Command::cargo_bin("rtmcc").unwrap()
}

#[test]
fn help_shows_usage() {
    rtmcc()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("RT-Micro-C compiler"));
}

#[test]
fn led_blink_compiles_to_vmb() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("blink.rtmc");
    let mut f = File::create(&src).unwrap();
    writeln!(
        f,
        "void run(){{ HW_GPIO_INIT(13,1); while(1){{ HW_GPIO_SET(13,1); RTOS_DELAY_MS(500); HW_GPIO_SET(13,0); RTOS_DELAY_MS(500);}} }}"
    )
    .unwrap();
    writeln!(f, "void main(){{ StartTask(1024,0,2,1,run); }}").unwrap();

    rtmcc().arg(&src).assert().success();
    let out = dir.path().join("blink.vmb");
    assert!(out.exists(), "default output next to the input");

    let image = vmb::read_image(&std::fs::read(&out).unwrap()).unwrap();
    let creates = image
        .instructions
        .iter()
        .filter(|i| i.opcode == codegen::Opcode::RtosCreateTask)
        .count();
    assert_eq!(creates, 1);
}

#[test]
fn output_flag_controls_path() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("t.rtmc");
    std::fs::write(&src, "void main(){}").unwrap();
    let out = dir.path().join("custom.vmb");

    rtmcc().arg(&src).arg("-o").arg(&out).assert().success();
    assert!(out.exists());
}

#[test]
fn tokens_flag_dumps_token_stream() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("t.rtmc");
    std::fs::write(&src, "int x = 42;\nvoid main(){}").unwrap();

    rtmcc()
        .arg(&src)
        .arg("--tokens")
        .assert()
        .success()
        .stdout(predicate::str::contains("Int(42)"));
}

#[test]
fn ast_flag_dumps_tree() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("t.rtmc");
    std::fs::write(&src, "void main(){ int x = 1; }").unwrap();

    rtmcc()
        .arg(&src)
        .arg("--ast")
        .assert()
        .success()
        .stdout(predicate::str::contains("Decl"));
}

#[test]
fn verbose_reports_passes() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("t.rtmc");
    std::fs::write(&src, "void main(){}").unwrap();

    rtmcc()
        .arg(&src)
        .arg("--verbose")
        .assert()
        .success()
        .stderr(predicate::str::contains("lexed"))
        .stderr(predicate::str::contains("wrote"));
}

#[test]
fn missing_input_is_io_error() {
    let dir = tempdir().unwrap();
    rtmcc()
        .arg(dir.path().join("ghost.rtmc"))
        .assert()
        .failure()
        .code(6);
}
