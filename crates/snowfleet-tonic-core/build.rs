/// Builds the gRPC client and server code for `proto/snowfleet.proto`.
///
/// Besides the service bindings, the encoded file descriptor set is written to
/// `OUT_DIR/snowfleet_descriptor.bin` so the server can expose gRPC
/// reflection.
///
/// Generated code is included in the crate via:
///
/// ```rust,ignore
/// pub mod proto {
///     tonic::include_proto!("snowfleet");
/// }
/// ```
use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let descriptor_path = out_dir.join("snowfleet_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    println!("cargo:rerun-if-changed=proto/snowfleet.proto");
    tonic_prost_build::configure().compile_with_config(
        config,
        &["proto/snowfleet.proto"],
        &["proto"],
    )?;
    Ok(())
}
