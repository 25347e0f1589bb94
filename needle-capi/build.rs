extern crate cbindgen;

fn main() {
    let crate_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => dir,
        Err(_) => return,
    };

    let mut config = cbindgen::Config::default();
    config.include_guard = Some("NEEDLE_H".to_string());
    config.language = cbindgen::Language::C;
    config.enumeration.prefix_with_name = true;

    // A missing header should not fail the library build.
    match cbindgen::Builder::new()
        .with_crate(crate_dir)
        .with_config(config)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file("target/needle.h");
        }
        Err(e) => println!("cargo:warning=unable to generate C bindings: {}", e),
    }
}
