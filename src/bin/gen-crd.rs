use flowshift::crd::Canary;
use kube::CustomResourceExt;

/// Prints the Canary CRD as JSON, which `kubectl apply -f -` accepts as is
fn main() -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&Canary::crd())?);
    Ok(())
}
