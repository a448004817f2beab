//! Exercise the PAM environment interface without authenticating.
//!
//! ```text
//! cargo run --features libpam --example pam_env -- <user>
//! ```

use std::sync::Arc;

use doorman_core::stack::libpam::LibPam;
use doorman_core::{Error, Handle, NoConversation, SessionConfig};

fn main() {
    let user = std::env::args().nth(1).unwrap_or_else(|| "nobody".to_string());

    let handle = Handle::new(LibPam::new(), SessionConfig::new(user), Arc::new(NoConversation))
        .expect("pam session");

    handle.setenv("CANARY", "FOO").expect("setenv");
    assert_eq!(handle.getenv("CANARY").expect("getenv"), "FOO");

    handle.unsetenv("CANARY").expect("unsetenv");
    match handle.getenv("CANARY") {
        Err(Error::EnvNotFound(_)) => {}
        other => panic!("expected EnvNotFound, got {other:?}"),
    }

    handle.setenv("CANARY", "FOO3").expect("setenv");
    let env = handle.env_map();
    assert_eq!(env.get("CANARY").map(String::as_str), Some("FOO3"));

    println!("pam environment round-trip ok:");
    for (name, value) in env {
        println!("  {name}={value}");
    }
}
