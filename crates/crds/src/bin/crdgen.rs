//! Prints the FrontendPage CustomResourceDefinition as YAML.
//!
//! ```sh
//! cargo run -p crds --bin crdgen > frontendpages.yaml
//! ```

use crds::FrontendPage;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crd = serde_yaml::to_string(&FrontendPage::crd())?;
    print!("{crd}");
    Ok(())
}
