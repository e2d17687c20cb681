fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored compiler so builds do not depend on a system protoc.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    // Maps become BTreeMaps so graph iteration order is deterministic.
    let mut config = prost_build::Config::new();
    config.btree_map(["."]);

    tonic_build::configure().compile_protos_with_config(
        config,
        &[
            "proto/pipeline.proto",
            "proto/expansion.proto",
            "proto/artifact.proto",
        ],
        &["proto"],
    )?;
    Ok(())
}
