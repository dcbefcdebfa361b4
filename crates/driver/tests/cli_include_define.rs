use assert_cmd::prelude::*;
use std::process::Command;
use tempfile::tempdir;

fn rtmcc() -> Command {
    Command::cargo_bin("rtmcc").unwrap()
}

// Include + define across files: int arr[N] with N from the included file
// allocates 4 ints of 4 bytes.
#[test]
fn include_and_define_size_an_array() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.rtmc"), "#define N 4\n").unwrap();
    let b = dir.path().join("b.rtmc");
    std::fs::write(&b, "#include \"a.rtmc\";\nint arr[N];\nvoid main(){}\n").unwrap();
    let out = dir.path().join("b.vmb");

    rtmcc().arg(&b).arg("-o").arg(&out).assert().success();

    let image = vmb::read_image(&std::fs::read(&out).unwrap()).unwrap();
    let alloc = image
        .instructions
        .iter()
        .find(|i| i.opcode == codegen::Opcode::AllocArray)
        .expect("array allocation for the global");
    assert_eq!(alloc.operands, vec![4, 4], "element size 4, count 4");
}

#[test]
fn include_idempotence_gives_identical_output() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("defs.rtmc"), "#define LED 13\n").unwrap();

    let once = dir.path().join("once.rtmc");
    std::fs::write(
        &once,
        "#include \"defs.rtmc\"\nvoid main(){ HW_GPIO_INIT(LED, 1); }\n",
    )
    .unwrap();
    let thrice = dir.path().join("thrice.rtmc");
    std::fs::write(
        &thrice,
        "#include \"defs.rtmc\"\n#include \"defs.rtmc\"\n#include \"defs.rtmc\"\nvoid main(){ HW_GPIO_INIT(LED, 1); }\n",
    )
    .unwrap();

    let out1 = dir.path().join("once.vmb");
    let out3 = dir.path().join("thrice.vmb");
    rtmcc().arg(&once).arg("-o").arg(&out1).arg("--release").assert().success();
    rtmcc().arg(&thrice).arg("-o").arg(&out3).arg("--release").assert().success();

    assert_eq!(
        std::fs::read(&out1).unwrap(),
        std::fs::read(&out3).unwrap(),
        "N includes behave like one"
    );
}

#[test]
fn release_builds_are_deterministic() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("t.rtmc");
    std::fs::write(
        &src,
        "message<int> Q;\nint total = 0;\nvoid main(){ Q.send(1); total = Q.recv(timeout: 50); DBG_PRINTF(\"total={}\", total); }\n",
    )
    .unwrap();

    let out1 = dir.path().join("one.vmb");
    let out2 = dir.path().join("two.vmb");
    rtmcc().arg(&src).arg("--release").arg("-o").arg(&out1).assert().success();
    rtmcc().arg(&src).arg("--release").arg("-o").arg(&out2).assert().success();

    assert_eq!(std::fs::read(&out1).unwrap(), std::fs::read(&out2).unwrap());
}

#[test]
fn release_images_are_smaller_than_debug() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("t.rtmc");
    std::fs::write(&src, "int g = 1;\nvoid main(){ g = g + 1; }\n").unwrap();

    let dbg = dir.path().join("dbg.vmb");
    let rel = dir.path().join("rel.vmb");
    rtmcc().arg(&src).arg("-o").arg(&dbg).assert().success();
    rtmcc().arg(&src).arg("--release").arg("-o").arg(&rel).assert().success();

    let dbg_len = std::fs::metadata(&dbg).unwrap().len();
    let rel_len = std::fs::metadata(&rel).unwrap().len();
    assert!(rel_len < dbg_len, "debug {} vs release {}", dbg_len, rel_len);

    let image = vmb::read_image(&std::fs::read(&rel).unwrap()).unwrap();
    assert!(image.symbols.is_empty());
    let image = vmb::read_image(&std::fs::read(&dbg).unwrap()).unwrap();
    assert_eq!(image.symbols, vec![("g".to_string(), 0)]);
}
