use crate::crd::canary::HttpMatchRequest;

/// Combine A/B analysis predicates with the service predicates
///
/// Without service predicates the analysis predicates are used as is.
/// Otherwise every analysis predicate is paired with every service
/// predicate: the service predicate is cloned and its headers, source
/// labels and query params are replaced by the analysis ones when set.
pub fn merge_match_conditions(
    analysis: &[HttpMatchRequest],
    service: &[HttpMatchRequest],
) -> Vec<HttpMatchRequest> {
    if service.is_empty() {
        return analysis.to_vec();
    }

    let mut merged = Vec::with_capacity(analysis.len() * service.len());
    for ab in analysis {
        for base in service {
            let mut m = base.clone();
            if ab.headers.is_some() {
                m.headers = ab.headers.clone();
            }
            if ab.source_labels.is_some() {
                m.source_labels = ab.source_labels.clone();
            }
            if ab.query_params.is_some() {
                m.query_params = ab.query_params.clone();
            }
            merged.push(m);
        }
    }
    merged
}
