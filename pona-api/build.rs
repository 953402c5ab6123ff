use std::path::{Path, PathBuf};

use anyhow::{Context as _, bail};

fn main() -> anyhow::Result<()> {
    let proto_dir = PathBuf::from_iter([std::env!("CARGO_MANIFEST_DIR"), "proto"]);
    println!("cargo:rerun-if-changed={}", proto_dir.display());

    let protos = proto_files(&proto_dir)?;
    if protos.is_empty() {
        bail!("no protobuf definitions found in {}", proto_dir.display());
    }

    tonic_prost_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&protos, &[proto_dir])
        .context("compiling cni protos")?;
    Ok(())
}

fn proto_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut protos = Vec::new();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.context("walking proto dir")?;
        if entry.path().extension().is_some_and(|ext| ext == "proto") {
            protos.push(entry.into_path());
        }
    }
    protos.sort();
    Ok(protos)
}
