// SPDX-License-Identifier: Apache-2.0
use std::env;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;

const SGX_SDK: &str = "/opt/intel/sgxsdk";
const ENCLAVE_DIR: &str = "enclave";

fn is_char_device(path: &str) -> bool {
    fs::metadata(path)
        .map(|m| m.file_type().is_char_device())
        .unwrap_or(false)
}

/// Compiles the edger8r stubs of the payload enclave and links the
/// patched untrusted runtime.
fn build_untrusted() {
    println!("cargo:rerun-if-env-changed=SGX_SDK");
    println!("cargo:rerun-if-env-changed=ENCLAVE_DIR");

    let sdk = PathBuf::from(env::var("SGX_SDK").unwrap_or_else(|_| SGX_SDK.into()));
    let enclave = PathBuf::from(env::var("ENCLAVE_DIR").unwrap_or_else(|_| ENCLAVE_DIR.into()));

    let stubs = enclave.join("encl_u.c");
    assert!(
        stubs.exists(),
        "{} is missing; run the edger8r on the enclave EDL first",
        stubs.display()
    );

    println!("cargo:rerun-if-changed={}", stubs.display());
    println!("cargo:rerun-if-changed={}", enclave.join("encl_u.h").display());

    cc::Build::new()
        .file(&stubs)
        .include(&enclave)
        .include(sdk.join("include"))
        .compile("encl_u");

    println!("cargo:rustc-link-search=native={}", sdk.join("lib64").display());
    println!("cargo:rustc-link-lib=dylib=sgx_urts");

    // The profiler resolves `start_single_stepping` against the executable.
    println!("cargo:rustc-link-arg-bins=-Wl,--export-dynamic");
}

fn main() {
    if env::var_os("CARGO_FEATURE_SGX").is_some() {
        build_untrusted();
    }

    if is_char_device("/dev/sgx_enclave") {
        println!("cargo:rustc-cfg=host_can_test_sgx");
    }
}
