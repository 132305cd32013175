/// Build script for afu_cxl crate.
///
/// Links the native libcxl accelerator-access library. When `LIBCXL_SRC`
/// names a libcxl source directory (the PSLSE checkout's `libcxl/`, or the
/// upstream library), its C sources are compiled into a static archive with
/// `cc`. Otherwise the prebuilt library is linked, searched in `LIBCXL_DIR`
/// when set and in the system paths.
use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=LIBCXL_SRC");
    println!("cargo:rerun-if-env-changed=LIBCXL_DIR");

    if let Ok(src) = env::var("LIBCXL_SRC") {
        let src_dir = PathBuf::from(src);
        let mut sources: Vec<PathBuf> = fs::read_dir(&src_dir)
            .expect("LIBCXL_SRC is not a readable directory")
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "c"))
            .collect();
        sources.sort();

        if sources.is_empty() {
            panic!("no C sources found in {}", src_dir.display());
        }

        cc::Build::new()
            .files(&sources)
            .include(&src_dir)
            .warnings(false)
            .compile("cxl");

        for source in &sources {
            println!("cargo:rerun-if-changed={}", source.display());
        }
        println!("cargo:rustc-link-lib=pthread");
        return;
    }

    if let Ok(dir) = env::var("LIBCXL_DIR") {
        println!("cargo:rustc-link-search=native={}", dir);
    }
    println!("cargo:rustc-link-lib=cxl");
}
