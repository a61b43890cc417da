use std::env;
use std::fs;
use std::path::Path;

const MAX_HEAP_VAR: &str = "SEG_ALLOC_MAX_HEAP_BYTES";
const DEFAULT_MAX_HEAP_BYTES: u64 = 64 << 20;

fn main() {
    println!("cargo:rerun-if-env-changed={}", MAX_HEAP_VAR);
    println!("cargo:rerun-if-changed=build.rs");

    let max_heap = match env::var(MAX_HEAP_VAR) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .unwrap_or_else(|e| panic!("{}={:?} is not a byte count: {}", MAX_HEAP_VAR, value, e)),
        Err(env::VarError::NotPresent) => DEFAULT_MAX_HEAP_BYTES,
        Err(e) => panic!("{}: {}", MAX_HEAP_VAR, e),
    };

    let out_dir = env::var("OUT_DIR").expect("cargo sets OUT_DIR for build scripts");
    let dest = Path::new(&out_dir).join("seg_alloc_max_heap_bytes.txt");
    fs::write(&dest, format!("{}", max_heap))
        .unwrap_or_else(|e| panic!("could not write {}: {}", dest.display(), e));
}
