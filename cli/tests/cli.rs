use assert_cmd::Command;
use predicates::prelude::*;

fn cloude() -> Command {
    Command::cargo_bin("cloude").unwrap()
}

const VALID_ARGS: &[&str] = &[
    "--cpu",
    "4",
    "--ram",
    "2",
    "--kernel",
    "/boot/vmlinux",
    "--initramfs",
    "/boot/initramfs.cpio.gz",
    "--file",
    "/var/lib/cloude/disk.img",
];

#[test]
fn help_works() {
    cloude()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("VM configuration CLI"));
}

#[test]
fn prints_the_resolved_configuration() {
    cloude()
        .args(VALID_ARGS)
        .assert()
        .success()
        .stdout(predicate::str::contains("CPU: 4"))
        .stdout(predicate::str::contains("RAM: 2 GB"))
        .stdout(predicate::str::contains("Kernel: /boot/vmlinux"));
}

#[test]
fn short_flags_are_accepted() {
    cloude()
        .args([
            "-c", "2", "-r", "1", "-k", "/boot/vmlinux", "-i", "/boot/initrd", "-f", "/tmp/disk",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("CPU: 2"));
}

#[test]
fn zero_cpus_are_rejected() {
    cloude()
        .args([
            "--cpu",
            "0",
            "--ram",
            "2",
            "--kernel",
            "/boot/vmlinux",
            "--initramfs",
            "/boot/initrd",
            "--file",
            "/tmp/disk",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value '0'"));
}

#[test]
fn missing_kernel_flag_is_an_error() {
    cloude()
        .args(["--cpu", "4", "--ram", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--kernel"));
}

#[test]
fn json_output_is_parseable() {
    let output = cloude()
        .args(VALID_ARGS)
        .args(["--output", "json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["cpu"], 4);
    assert_eq!(parsed["ram_gb"], 2);
    assert_eq!(parsed["kernel"], "/boot/vmlinux");
}
