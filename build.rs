use std::env;
use std::path::{Path, PathBuf};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=CACTUS_LIB_DIR");
    println!("cargo:rerun-if-env-changed=CACTUS_SOURCE_DIR");

    // Only the native engine needs a link step; the trait layer is pure Rust.
    if env::var_os("CARGO_FEATURE_NATIVE").is_none() {
        return;
    }

    if let Ok(lib_dir) = env::var("CACTUS_LIB_DIR") {
        println!("cargo:rustc-link-search=native={}", lib_dir);
        link_system_libraries();
        return;
    }

    let source_dir = match env::var("CACTUS_SOURCE_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_default());
            manifest_dir.join("cactus")
        }
    };

    if !source_dir.join("CMakeLists.txt").exists() {
        println!(
            "cargo:warning=cactus sources not found at {:?}; set CACTUS_LIB_DIR to a prebuilt libcactus",
            source_dir
        );
        println!("cargo:warning=or CACTUS_SOURCE_DIR to a cactus checkout");
        return;
    }

    let dst = build_cactus(&source_dir);
    println!("cargo:rustc-link-search=native={}/lib", dst.display());
    link_system_libraries();
}

fn build_cactus(source_dir: &Path) -> PathBuf {
    cmake::Config::new(source_dir)
        .define("CACTUS_BUILD_SHARED", "ON")
        .define("GGML_NATIVE", "OFF")
        .define("GGML_METAL", if cfg!(target_os = "macos") { "ON" } else { "OFF" })
        .define("LLAMA_BUILD_TESTS", "OFF")
        .define("LLAMA_BUILD_EXAMPLES", "OFF")
        .profile("Release")
        .build()
}

fn link_system_libraries() {
    let target = env::var("TARGET").unwrap_or_default();

    if target.contains("apple") {
        println!("cargo:rustc-link-lib=framework=Accelerate");
        println!("cargo:rustc-link-lib=framework=Metal");
        println!("cargo:rustc-link-lib=framework=Foundation");
        println!("cargo:rustc-link-lib=dylib=c++");
    } else if target.contains("android") {
        println!("cargo:rustc-link-lib=dylib=c++_shared");
        println!("cargo:rustc-link-lib=dylib=log");
    } else if target.contains("linux") {
        println!("cargo:rustc-link-lib=dylib=stdc++");
    }
}
