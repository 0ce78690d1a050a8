//! Prints the CustomResourceDefinition manifests for all CRDs in this crate.
//!
//! ```sh
//! cargo run -p crds --bin crdgen > config/crd/webpages.yaml
//! ```

use crds::WebPage;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&WebPage::crd())?;
    print!("{yaml}");
    Ok(())
}
