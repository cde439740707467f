//! Prints the Function CRD manifest as YAML.
//!
//! The controller registers the same definition at startup; this binary exists
//! so the manifest can be applied ahead of time (`crdgen | kubectl apply -f -`).

fn main() -> Result<(), serde_yaml::Error> {
    let manifest = serde_yaml::to_string(&crds::function_crd())?;
    print!("{manifest}");
    Ok(())
}
