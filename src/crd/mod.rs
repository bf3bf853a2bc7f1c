pub mod apisix;
pub mod appmesh;
pub mod canary;
pub mod contour;
pub mod gloo;
pub mod istio;
pub mod knative;
pub mod kuma;
pub mod smi;
pub mod traefik;

pub use canary::{Canary, CanarySpec, CanaryStatus};

