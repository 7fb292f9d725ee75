//! Policy presets offered to wallet clients
//!
//! Thresholds are in atomic units (1 DGB = 100,000,000).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::guardian::types::GuardianRule;
use crate::shield::heuristics::DGB_ATOMS;
use crate::shield::types::ActionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// High protection, high friction
    Conservative,
    /// Default for most users
    Balanced,
    /// Guards only extreme operations
    Aggressive,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Preset::Conservative, Preset::Balanced, Preset::Aggressive];

    pub fn description(&self) -> &'static str {
        match self {
            Preset::Conservative => "High protection / high friction policy.",
            Preset::Balanced => "Default preset for most users.",
            Preset::Aggressive => "Low friction, guards only extreme operations.",
        }
    }

    /// Build the preset's rules for a guardian roster
    pub fn rules(&self, guardian_ids: &[String]) -> Result<Vec<GuardianRule>> {
        let Some(first) = guardian_ids.first() else {
            return Err(Error::ConfigInvalid(format!(
                "{} preset requires at least one guardian id",
                self
            )));
        };
        let all = guardian_ids.to_vec();
        let one = vec![first.clone()];
        let for_large = guardian_ids.len().clamp(1, 2) as u32;

        let rules = match self {
            Preset::Conservative => vec![
                GuardianRule::threshold("conservative_send_large", ActionKind::Send, 1_000 * DGB_ATOMS, for_large, all.clone())
                    .with_description("Require guardian approval for large DGB sends."),
                GuardianRule::threshold("conservative_dd_mint_large", ActionKind::DdMint, 500 * DGB_ATOMS, for_large, all.clone())
                    .with_description("Require guardian approval for large DigiDollar mints."),
                GuardianRule::threshold("conservative_dd_redeem_large", ActionKind::DdRedeem, 500 * DGB_ATOMS, for_large, all)
                    .with_description("Require guardian approval for large DigiDollar redeems."),
            ],
            Preset::Balanced => vec![
                GuardianRule::threshold("balanced_send_medium", ActionKind::Send, 100 * DGB_ATOMS, 1, one.clone())
                    .with_description("Ask for guardian confirmation on medium / large DGB sends."),
                GuardianRule::threshold("balanced_send_large", ActionKind::Send, 1_000 * DGB_ATOMS, for_large, all)
                    .with_description("Require multiple guardian approvals for very large sends."),
                GuardianRule::threshold("balanced_dd_mint_large", ActionKind::DdMint, 250 * DGB_ATOMS, 1, one.clone())
                    .with_description("Guardian confirmation for large DigiDollar mints."),
                GuardianRule::threshold("balanced_dd_redeem_large", ActionKind::DdRedeem, 250 * DGB_ATOMS, 1, one)
                    .with_description("Guardian confirmation for large DigiDollar redeems."),
            ],
            Preset::Aggressive => vec![
                GuardianRule::threshold("aggressive_send_extreme", ActionKind::Send, 10_000 * DGB_ATOMS, 1, one.clone())
                    .with_description("Only guard extremely large sends."),
                GuardianRule::threshold("aggressive_dd_mint_extreme", ActionKind::DdMint, 5_000 * DGB_ATOMS, 1, one.clone())
                    .with_description("Only guard extremely large DigiDollar mints."),
                GuardianRule::threshold("aggressive_dd_redeem_extreme", ActionKind::DdRedeem, 5_000 * DGB_ATOMS, 1, one)
                    .with_description("Only guard extremely large DigiDollar redeems."),
            ],
        };

        Ok(rules)
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Preset::Conservative => write!(f, "conservative"),
            Preset::Balanced => write!(f, "balanced"),
            Preset::Aggressive => write!(f, "aggressive"),
        }
    }
}

impl FromStr for Preset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "conservative" => Ok(Preset::Conservative),
            "balanced" => Ok(Preset::Balanced),
            "aggressive" => Ok(Preset::Aggressive),
            other => Err(Error::ConfigInvalid(format!("Unknown guardian preset '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("g{}", i)).collect()
    }

    #[test]
    fn test_presets_need_a_guardian() {
        for preset in Preset::ALL {
            assert!(preset.rules(&[]).is_err());
        }
    }

    #[test]
    fn test_conservative_caps_approvals() {
        let rules = Preset::Conservative.rules(&ids(1)).unwrap();
        assert!(rules.iter().all(|r| r.min_approvals == 1));

        let rules = Preset::Conservative.rules(&ids(5)).unwrap();
        let send = rules.iter().find(|r| r.action == ActionKind::Send).unwrap();
        assert_eq!(send.min_approvals, 2);
        assert_eq!(send.threshold_value, Some(1_000 * DGB_ATOMS));
        assert_eq!(send.guardian_ids.len(), 5);
    }

    #[test]
    fn test_balanced_tiers() {
        let rules = Preset::Balanced.rules(&ids(3)).unwrap();
        let sends: Vec<_> = rules.iter().filter(|r| r.action == ActionKind::Send).collect();
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[0].threshold_value, Some(100 * DGB_ATOMS));
        assert_eq!(sends[0].guardian_ids, vec!["g1".to_string()]);
        assert_eq!(sends[1].min_approvals, 2);
    }

    #[test]
    fn test_preset_rules_validate() {
        for preset in Preset::ALL {
            for rule in preset.rules(&ids(2)).unwrap() {
                assert!(rule.validate().is_ok(), "{}", rule.id);
            }
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!(" Balanced ".parse::<Preset>().unwrap(), Preset::Balanced);
        assert!("yolo".parse::<Preset>().is_err());
    }
}
