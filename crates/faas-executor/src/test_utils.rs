/// Test utilities for conditional test execution
use std::process::Command;

pub fn has_python() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn has_node() -> bool {
    Command::new("node")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn has_sh() -> bool {
    cfg!(unix) && std::path::Path::new("/bin/sh").exists()
}

/// Macro to skip tests when requirements aren't met
#[macro_export]
macro_rules! require_python {
    () => {
        if !$crate::test_utils::has_python() {
            eprintln!("Test ignored: python3 not available");
            return;
        }
    };
}

#[macro_export]
macro_rules! require_node {
    () => {
        if !$crate::test_utils::has_node() {
            eprintln!("Test ignored: node not available");
            return;
        }
    };
}

#[macro_export]
macro_rules! require_sh {
    () => {
        if !$crate::test_utils::has_sh() {
            eprintln!("Test ignored: /bin/sh not available");
            return;
        }
    };
}
