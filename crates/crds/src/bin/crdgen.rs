//! Prints the CRD manifests as a multi-document YAML stream.

use crds::{BuildConfiguration, BuildRecord, NodePool, RenderedConfig};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        BuildConfiguration::crd(),
        BuildRecord::crd(),
        NodePool::crd(),
        RenderedConfig::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
