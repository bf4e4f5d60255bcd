//! Locates the libfabric C library the `ffi` module links against.
//!
//! The actual provider (`verbs` vs `sockets`) is chosen at runtime by
//! `Config`/`Zone`; at link time we only need `libfabric` itself.

fn main() {
    if pkg_config::Config::new().probe("libfabric").is_ok() {
        return;
    }

    // Fall back to a bare `-lfabric` for environments where libfabric is
    // installed without a .pc file (common for source builds).
    println!("cargo:rustc-link-lib=dylib=fabric");
}
