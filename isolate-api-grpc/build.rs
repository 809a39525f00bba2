use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    tonic_prost_build::configure()
        .file_descriptor_set_path(out_dir.join("isolate.bin"))
        .type_attribute("isolate.v1.LogLevel", "#[derive(serde::Serialize, serde::Deserialize)]")
        .type_attribute("isolate.v1.LogSource", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile_protos(&["proto/isolate/v1/isolate.proto"], &["proto"])?;

    Ok(())
}
