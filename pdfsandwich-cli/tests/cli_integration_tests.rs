//! Black-box tests against the compiled binary: argument validation and
//! the stable exit-code contract. Anything needing real external tools
//! (tesseract, pdftoppm) lives outside the test suite; these cases fail
//! before any collaborator is spawned.

use std::process::Command;

fn pdfsandwich() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pdfsandwich"))
}

#[test]
fn help_exits_zero() {
    let output = pdfsandwich().arg("--help").output().unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("--skip-text"));
    assert!(text.contains("--optimize"));
}

#[test]
fn missing_operands_exit_one() {
    let output = pdfsandwich().output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(!output.stderr.is_empty());
    assert!(output.stdout.is_empty());
}

#[test]
fn conflicting_modes_exit_one() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    std::fs::write(&input, b"%PDF-1.7\n").unwrap();
    let output = pdfsandwich()
        .arg("--skip-text")
        .arg("--force-ocr")
        .arg(&input)
        .arg(dir.path().join("out.pdf"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn invalid_optimize_level_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    std::fs::write(&input, b"%PDF-1.7\n").unwrap();
    let output = pdfsandwich()
        .arg("--optimize")
        .arg("9")
        .arg(&input)
        .arg(dir.path().join("out.pdf"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn non_pdf_input_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    std::fs::write(&input, b"GIF89a this is not a pdf").unwrap();
    let out_path = dir.path().join("out.pdf");
    let output = pdfsandwich()
        // OCR disabled so no external tools are probed before the
        // signature check runs.
        .arg("--ocr-timeout")
        .arg("0")
        .arg("--output-type")
        .arg("pdf")
        .arg(&input)
        .arg(&out_path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(!out_path.exists());
}

#[test]
fn bad_page_range_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    std::fs::write(&input, b"%PDF-1.7\n").unwrap();
    let output = pdfsandwich()
        .arg("--pages")
        .arg("7-3")
        .arg(&input)
        .arg(dir.path().join("out.pdf"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn bad_config_file_exits_nine() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("pdfsandwich.toml");
    std::fs::write(&config, "not_a_real_option = true\n").unwrap();
    let input = dir.path().join("in.pdf");
    std::fs::write(&input, b"%PDF-1.7\n").unwrap();
    let output = pdfsandwich()
        .arg("--config")
        .arg(&config)
        .arg(&input)
        .arg(dir.path().join("out.pdf"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(9));
}

#[test]
fn version_prints_and_exits_zero() {
    let output = pdfsandwich().arg("--version").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("pdfsandwich"));
}

#[test]
fn diagnostics_go_to_stderr_not_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.pdf");
    std::fs::write(&input, b"junk").unwrap();
    let output = pdfsandwich()
        .arg("--ocr-timeout")
        .arg("0")
        .arg("--output-type")
        .arg("pdf")
        .arg(&input)
        .arg("-")
        .output()
        .unwrap();
    // The run fails (not a PDF), and nothing lands on stdout.
    assert_ne!(output.status.code(), Some(0));
    assert!(output.stdout.is_empty());
    assert!(!output.stderr.is_empty());
}
