use super::RouterError;
use crate::crd::Canary;

/// Traffic split between the primary and canary destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Weights {
    pub primary: u32,
    pub canary: u32,
    /// Canary receives a mirrored copy of primary traffic
    pub mirrored: bool,
}

impl Weights {
    pub fn new(primary: u32, canary: u32) -> Self {
        Self {
            primary,
            canary,
            mirrored: false,
        }
    }

    pub fn mirrored(primary: u32, canary: u32) -> Self {
        Self {
            primary,
            canary,
            mirrored: true,
        }
    }

    /// Split derived from a primary weight, used by backends that only
    /// encode one side
    pub fn from_primary(primary: u32) -> Self {
        Self::new(primary, 100u32.saturating_sub(primary))
    }

    pub fn from_canary(canary: u32) -> Self {
        Self::new(100u32.saturating_sub(canary), canary)
    }

    /// Reject a split that routes traffic nowhere
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.primary == 0 && self.canary == 0 {
            return Err(RouterError::InvalidInput(
                "primary and canary weights cannot both be 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for Weights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "primary={} canary={}", self.primary, self.canary)?;
        if self.mirrored {
            write!(f, " mirrored")?;
        }
        Ok(())
    }
}

/// Weights written when a route object is first created
///
/// Progressive initialization starts with all traffic on the canary so the
/// primary can be bootstrapped from it.
pub fn initial_weights(canary: &Canary) -> Weights {
    if canary.progressive_initialization() {
        Weights::new(0, 100)
    } else {
        Weights::new(100, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::testing::podinfo;

    #[test]
    fn test_validate_rejects_zero_split() {
        assert!(matches!(
            Weights::new(0, 0).validate(),
            Err(RouterError::InvalidInput(_))
        ));
        assert!(Weights::new(0, 100).validate().is_ok());
        assert!(Weights::new(100, 0).validate().is_ok());
    }

    #[test]
    fn test_derived_side_sums_to_100() {
        assert_eq!(Weights::from_primary(70), Weights::new(70, 30));
        assert_eq!(Weights::from_canary(30), Weights::new(70, 30));
        assert_eq!(Weights::from_canary(150), Weights::new(0, 150));
    }

    #[test]
    fn test_initial_weights() {
        let mut canary = podinfo();
        assert_eq!(initial_weights(&canary), Weights::new(100, 0));

        canary
            .spec
            .analysis
            .get_or_insert_with(Default::default)
            .progressive_initialization = true;
        assert_eq!(initial_weights(&canary), Weights::new(0, 100));
    }
}
