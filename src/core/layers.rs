//! Layer role assignment and lesion masks, plus the name resolution that
//! turns configured layer names into [`LayerId`] handles.

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::network::{resolve, LayerId, LayerRole, Network};

/// Which driven layers are inputs, targets or compare layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerRoleAssignment {
    roles: BTreeMap<LayerId, LayerRole>,
}

impl LayerRoleAssignment {
    pub fn get(&self, id: LayerId) -> Option<LayerRole> {
        self.roles.get(&id).copied()
    }

    pub fn set(&mut self, id: LayerId, role: LayerRole) -> Option<LayerRole> {
        self.roles.insert(id, role)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LayerId, LayerRole)> + '_ {
        self.roles.iter().map(|(&id, &role)| (id, role))
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

/// Per-layer active flag. Layers absent from the mask are active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LesionMask {
    active: BTreeMap<LayerId, bool>,
}

impl LesionMask {
    pub fn is_active(&self, id: LayerId) -> bool {
        self.active.get(&id).copied().unwrap_or(true)
    }

    /// Only lesions are stored, so masks that agree on every layer compare
    /// equal.
    pub fn set_active(&mut self, id: LayerId, active: bool) {
        if active {
            self.active.remove(&id);
        } else {
            self.active.insert(id, false);
        }
    }

    pub fn lesioned(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.active
            .iter()
            .filter(|(_, active)| !**active)
            .map(|(&id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LayerId, bool)> + '_ {
        self.active.iter().map(|(&id, &a)| (id, a))
    }
}

/// Snapshot of roles and lesions; a protocol restores this after each phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerConfig {
    pub roles: LayerRoleAssignment,
    pub lesions: LesionMask,
}

/// A pre-phase structural change, by layer name.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "op", rename_all = "snake_case"))]
pub enum LayerOp {
    SetRole { layer: String, role: LayerRole },
    SetActive { layer: String, active: bool },
}

impl LayerOp {
    pub fn role(layer: impl Into<String>, role: LayerRole) -> Self {
        LayerOp::SetRole {
            layer: layer.into(),
            role,
        }
    }

    pub fn lesion(layer: impl Into<String>) -> Self {
        LayerOp::SetActive {
            layer: layer.into(),
            active: false,
        }
    }

    pub fn unlesion(layer: impl Into<String>) -> Self {
        LayerOp::SetActive {
            layer: layer.into(),
            active: true,
        }
    }

    pub fn layer(&self) -> &str {
        match self {
            LayerOp::SetRole { layer, .. } | LayerOp::SetActive { layer, .. } => layer,
        }
    }

    pub fn resolve<N: Network + ?Sized>(&self, net: &N) -> SimResult<ResolvedOp> {
        let id = resolve(net, self.layer())?;
        Ok(match self {
            LayerOp::SetRole { role, .. } => ResolvedOp::SetRole(id, *role),
            LayerOp::SetActive { active, .. } => ResolvedOp::SetActive(id, *active),
        })
    }
}

/// A [`LayerOp`] with its layer resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedOp {
    SetRole(LayerId, LayerRole),
    SetActive(LayerId, bool),
}

impl ResolvedOp {
    pub fn apply_to(self, cfg: &mut LayerConfig) {
        match self {
            ResolvedOp::SetRole(id, role) => {
                cfg.roles.set(id, role);
            }
            ResolvedOp::SetActive(id, active) => cfg.lesions.set_active(id, active),
        }
    }
}

/// A driven layer: one that receives external values from trial records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrivenLayer {
    pub id: LayerId,
    pub name: String,
    pub size: usize,
}

/// Driven layers, resolved against a network once at configuration time.
#[derive(Debug, Clone, Default)]
pub struct LayerTable {
    driven: Vec<DrivenLayer>,
}

impl LayerTable {
    /// Resolve `(name, role)` pairs. Unknown names and duplicates fail fast.
    pub fn resolve<N: Network + ?Sized>(
        net: &N,
        layers: &[(String, LayerRole)],
    ) -> SimResult<(Self, LayerRoleAssignment)> {
        let mut driven = Vec::with_capacity(layers.len());
        let mut roles = LayerRoleAssignment::default();
        for (name, role) in layers {
            let id = resolve(net, name)?;
            if roles.set(id, *role).is_some() {
                return Err(SimError::Configuration(format!(
                    "layer `{name}` listed twice"
                )));
            }
            driven.push(DrivenLayer {
                id,
                name: net.layer_name(id).to_string(),
                size: net.layer_size(id),
            });
        }
        Ok((Self { driven }, roles))
    }

    pub fn driven(&self) -> &[DrivenLayer] {
        &self.driven
    }

    pub fn find(&self, name: &str) -> Option<&DrivenLayer> {
        self.driven.iter().find(|l| l.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingNet;

    #[test]
    fn lesion_mask_defaults_to_active() {
        let mut mask = LesionMask::default();
        assert!(mask.is_active(LayerId(3)));
        mask.set_active(LayerId(3), false);
        assert!(!mask.is_active(LayerId(3)));
        assert_eq!(mask.lesioned().collect::<Vec<_>>(), vec![LayerId(3)]);
        mask.set_active(LayerId(3), true);
        assert_eq!(mask, LesionMask::default());
    }

    #[test]
    fn resolve_unknown_layer_fails() {
        let net = RecordingNet::new(&[("In", 2), ("Out", 2)]);
        let err = LayerTable::resolve(
            &net,
            &[
                ("In".to_string(), LayerRole::Input),
                ("Nope".to_string(), LayerRole::Target),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, SimError::UnknownLayer(name) if name == "Nope"));
    }

    #[test]
    fn resolve_duplicate_layer_fails() {
        let net = RecordingNet::new(&[("In", 2)]);
        let err = LayerTable::resolve(
            &net,
            &[
                ("In".to_string(), LayerRole::Input),
                ("In".to_string(), LayerRole::Target),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, SimError::Configuration(_)));
    }

    #[test]
    fn resolved_ops_update_config() {
        let net = RecordingNet::new(&[("In", 2), ("Out", 3)]);
        let (table, roles) = LayerTable::resolve(
            &net,
            &[
                ("In".to_string(), LayerRole::Input),
                ("Out".to_string(), LayerRole::Target),
            ],
        )
        .unwrap();
        assert_eq!(table.find("Out").map(|l| l.size), Some(3));

        let mut cfg = LayerConfig {
            roles,
            lesions: LesionMask::default(),
        };
        LayerOp::role("Out", LayerRole::Compare)
            .resolve(&net)
            .unwrap()
            .apply_to(&mut cfg);
        LayerOp::lesion("In").resolve(&net).unwrap().apply_to(&mut cfg);

        assert_eq!(cfg.roles.get(LayerId(1)), Some(LayerRole::Compare));
        assert!(!cfg.lesions.is_active(LayerId(0)));
    }
}
