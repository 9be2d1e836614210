fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/");

    // Use vendored protoc
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    prost_build::Config::new()
        .bytes(["."])
        .compile_protos(&["proto/mu.proto"], &["proto/"])?;

    Ok(())
}
