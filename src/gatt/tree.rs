use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::att::Handle;
use crate::gap::Uuid;

use super::stack::ServiceDef;
use super::{Error, Perm, Prop, Result, ServiceType};

/// Wire representation of a discovered or registered service. Included
/// services keep their nesting; characteristics and descriptors are flat
/// lists annotated with their owning node's handle.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Service {
    pub handle: u16,
    /// Canonical uppercase UUID string.
    pub uuid: String,
    pub service_type: ServiceType,
    pub included_services: Vec<Service>,
    pub characteristics: Vec<Characteristic>,
}

/// Wire representation of a characteristic.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Characteristic {
    pub handle: u16,
    pub uuid: String,
    pub properties: u8,
    pub permissions: u16,
    pub descriptors: Vec<Descriptor>,
}

/// Wire representation of a descriptor.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Descriptor {
    pub handle: u16,
    pub uuid: String,
    pub permissions: u16,
}

/// Index of a service node within the arena.
type Idx = usize;

/// Attribute tree snapshot: an arena of service nodes in stack order, with
/// included services referenced by index rather than back-pointers.
/// Building rejects cyclic includes and malformed handles, so traversal is
/// bounded by construction.
#[derive(Clone, Debug, Default)]
pub(super) struct Tree {
    services: Vec<ServiceNode>,
}

#[derive(Clone, Debug)]
struct ServiceNode {
    hdl: Handle,
    uuid: Uuid,
    typ: ServiceType,
    includes: SmallVec<[Idx; 2]>,
    chars: Vec<CharNode>,
}

#[derive(Clone, Debug)]
pub(super) struct CharNode {
    pub hdl: Handle,
    pub uuid: Uuid,
    pub props: Prop,
    pub perms: Perm,
    descs: Vec<DescNode>,
}

#[derive(Clone, Debug)]
pub(super) struct DescNode {
    pub hdl: Handle,
    pub uuid: Uuid,
    pub perms: Perm,
}

impl Tree {
    /// Builds the arena from the stack's native service list. Every
    /// attribute must carry a unique non-zero handle and include references
    /// must resolve acyclically within the list.
    pub fn build(defs: &[ServiceDef]) -> Result<Self> {
        let mut by_hdl = HashMap::with_capacity(defs.len());
        let mut seen = HashSet::with_capacity(defs.len() * 4);
        for (i, def) in defs.iter().enumerate() {
            if by_hdl.insert(def.hdl, i).is_some() {
                return Err(Error::InvalidTree("duplicate service handle"));
            }
        }
        let mut services = Vec::with_capacity(defs.len());
        for def in defs {
            let mut includes = SmallVec::new();
            for &inc in &def.includes {
                let &i = (by_hdl.get(&inc)).ok_or(Error::InvalidTree("unresolved include"))?;
                includes.push(i);
            }
            let mut chars = Vec::with_capacity(def.characteristics.len());
            for c in &def.characteristics {
                let mut descs = Vec::with_capacity(c.descriptors.len());
                for d in &c.descriptors {
                    descs.push(DescNode {
                        hdl: claim(d.hdl, &mut seen)?,
                        uuid: d.uuid,
                        perms: d.perms,
                    });
                }
                chars.push(CharNode {
                    hdl: claim(c.hdl, &mut seen)?,
                    uuid: c.uuid,
                    props: c.props,
                    perms: c.perms,
                    descs,
                });
            }
            services.push(ServiceNode {
                hdl: claim(def.hdl, &mut seen)?,
                uuid: def.uuid,
                typ: def.typ,
                includes,
                chars,
            });
        }
        let tree = Self { services };
        tree.check_acyclic()?;
        Ok(tree)
    }

    /// Rejects cyclic service inclusion: the forest must stay a tree.
    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, Eq, PartialEq)]
        enum Mark {
            New,
            Open,
            Done,
        }
        fn visit(services: &[ServiceNode], marks: &mut [Mark], i: Idx) -> Result<()> {
            match marks[i] {
                Mark::Done => return Ok(()),
                Mark::Open => return Err(Error::InvalidTree("cyclic service include")),
                Mark::New => {}
            }
            marks[i] = Mark::Open;
            for &inc in &services[i].includes {
                visit(services, marks, inc)?;
            }
            marks[i] = Mark::Done;
            Ok(())
        }
        let mut marks = vec![Mark::New; self.services.len()];
        for i in 0..self.services.len() {
            visit(&self.services, &mut marks, i)?;
        }
        Ok(())
    }

    /// Returns the characteristic with the given value handle. Matching is
    /// by handle identity only; sibling UUIDs may legally collide.
    pub fn find_characteristic(&self, hdl: Handle) -> Option<&CharNode> {
        (0..self.services.len()).find_map(|i| self.char_in(i, hdl))
    }

    fn char_in(&self, i: Idx, hdl: Handle) -> Option<&CharNode> {
        let s = &self.services[i];
        for &inc in &s.includes {
            if let Some(c) = self.char_in(inc, hdl) {
                return Some(c);
            }
        }
        s.chars.iter().find(|c| c.hdl == hdl)
    }

    /// Returns the descriptor with the given handle, by handle identity
    /// only.
    pub fn find_descriptor(&self, hdl: Handle) -> Option<&DescNode> {
        self.descriptor(hdl).map(|(_, d)| d)
    }

    /// Returns the characteristic owning the descriptor with the given
    /// handle.
    pub fn characteristic_of(&self, desc: Handle) -> Option<&CharNode> {
        self.descriptor(desc).map(|(c, _)| c)
    }

    fn descriptor(&self, hdl: Handle) -> Option<(&CharNode, &DescNode)> {
        (0..self.services.len()).find_map(|i| self.desc_in(i, hdl))
    }

    fn desc_in(&self, i: Idx, hdl: Handle) -> Option<(&CharNode, &DescNode)> {
        let s = &self.services[i];
        for &inc in &s.includes {
            if let Some(found) = self.desc_in(inc, hdl) {
                return Some(found);
            }
        }
        s.chars.iter().find_map(|c| {
            (c.descs.iter().find(|d| d.hdl == hdl)).map(|d| (c, d))
        })
    }

    /// Produces the wire forest in stack order.
    pub fn flatten(&self) -> Vec<Service> {
        (0..self.services.len()).map(|i| self.service_at(i)).collect()
    }

    fn service_at(&self, i: Idx) -> Service {
        let s = &self.services[i];
        Service {
            handle: s.hdl.into(),
            uuid: s.uuid.to_string(),
            service_type: s.typ,
            included_services: s.includes.iter().map(|&j| self.service_at(j)).collect(),
            characteristics: s.chars.iter().map(wire_char).collect(),
        }
    }
}

/// Validates a raw handle and claims it as unique within the tree.
fn claim(raw: u16, seen: &mut HashSet<u16>) -> Result<Handle> {
    let hdl = Handle::new(raw).ok_or(Error::InvalidTree("attribute without an assigned handle"))?;
    if !seen.insert(raw) {
        return Err(Error::InvalidTree("duplicate attribute handle"));
    }
    Ok(hdl)
}

fn wire_char(c: &CharNode) -> Characteristic {
    Characteristic {
        handle: c.hdl.into(),
        uuid: c.uuid.to_string(),
        properties: c.props.bits(),
        permissions: c.perms.bits(),
        descriptors: (c.descs.iter()).map(|d| Descriptor {
            handle: d.hdl.into(),
            uuid: d.uuid.to_string(),
            permissions: d.perms.bits(),
        }).collect(),
    }
}

#[cfg(test)]
mod tests {
    use crate::gap::Uuid16;
    use crate::gatt::stack::{CharacteristicDef, DescriptorDef};

    use super::*;

    fn uuid(v: u16) -> Uuid {
        Uuid16::new(v).unwrap().as_uuid()
    }

    fn chr(hdl: u16, u: u16, descs: Vec<DescriptorDef>) -> CharacteristicDef {
        CharacteristicDef {
            hdl,
            uuid: uuid(u),
            props: Prop::READ | Prop::WRITE,
            perms: Perm::READ | Perm::WRITE,
            descriptors: descs,
        }
    }

    fn desc(hdl: u16, u: u16) -> DescriptorDef {
        DescriptorDef {
            hdl,
            uuid: uuid(u),
            perms: Perm::READ | Perm::WRITE,
        }
    }

    fn svc(hdl: u16, u: u16, includes: &[u16], chars: Vec<CharacteristicDef>) -> ServiceDef {
        ServiceDef {
            hdl,
            uuid: uuid(u),
            typ: ServiceType::Primary,
            includes: includes.iter().copied().collect(),
            characteristics: chars,
        }
    }

    #[test]
    fn same_uuid_siblings_resolve_by_handle() {
        // Two characteristics with identical UUIDs under one service and a
        // duplicate under another service.
        let tree = Tree::build(&[
            svc(1, 0x180D, &[], vec![chr(2, 0x2A37, vec![desc(3, 0x2902)]), chr(4, 0x2A37, vec![desc(5, 0x2902)])]),
            svc(6, 0x180F, &[], vec![chr(7, 0x2A37, vec![])]),
        ])
        .unwrap();
        for h in [2, 4, 7] {
            let hdl = Handle::new(h).unwrap();
            assert_eq!(tree.find_characteristic(hdl).unwrap().hdl, hdl);
        }
        for h in [3, 5] {
            let hdl = Handle::new(h).unwrap();
            assert_eq!(tree.find_descriptor(hdl).unwrap().hdl, hdl);
        }
        assert_eq!(
            u16::from(tree.characteristic_of(Handle::new(5).unwrap()).unwrap().hdl),
            4
        );
        assert!(tree.find_characteristic(Handle::new(9).unwrap()).is_none());
        assert!(tree.find_descriptor(Handle::new(2).unwrap()).is_none());
    }

    #[test]
    fn flatten_preserves_nesting() {
        let tree = Tree::build(&[
            svc(1, 0x1801, &[4], vec![chr(2, 0x2A05, vec![desc(3, 0x2902)])]),
            svc(4, 0x180F, &[], vec![chr(5, 0x2A19, vec![])]),
        ])
        .unwrap();
        let wire = tree.flatten();
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].handle, 1);
        assert_eq!(wire[0].uuid, "00001801-0000-1000-8000-00805F9B34FB");
        assert_eq!(wire[0].included_services.len(), 1);
        assert_eq!(wire[0].included_services[0].handle, 4);
        assert_eq!(wire[0].characteristics.len(), 1);
        assert_eq!(wire[0].characteristics[0].handle, 2);
        assert_eq!(wire[0].characteristics[0].descriptors[0].handle, 3);
        // The included service also appears at the top level.
        assert_eq!(wire[1].handle, 4);
        assert_eq!(wire[1].characteristics[0].handle, 5);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(
            Tree::build(&[svc(0, 0x180D, &[], vec![])]),
            Err(Error::InvalidTree("attribute without an assigned handle"))
        ));
        assert!(matches!(
            Tree::build(&[svc(1, 0x180D, &[], vec![chr(1, 0x2A37, vec![])])]),
            Err(Error::InvalidTree("duplicate attribute handle"))
        ));
        assert!(matches!(
            Tree::build(&[svc(1, 0x180D, &[9], vec![])]),
            Err(Error::InvalidTree("unresolved include"))
        ));
    }

    #[test]
    fn rejects_cyclic_includes() {
        let a = svc(1, 0x180D, &[2], vec![]);
        let b = svc(2, 0x180F, &[1], vec![]);
        assert!(matches!(
            Tree::build(&[a, b]),
            Err(Error::InvalidTree("cyclic service include"))
        ));
        // Self-inclusion is the degenerate cycle.
        assert!(matches!(
            Tree::build(&[svc(1, 0x180D, &[1], vec![])]),
            Err(Error::InvalidTree("cyclic service include"))
        ));
        // A diamond is acyclic and stays legal.
        let tree = Tree::build(&[
            svc(1, 0x1800, &[3], vec![]),
            svc(2, 0x1801, &[3], vec![]),
            svc(3, 0x180F, &[], vec![]),
        ]);
        assert!(tree.is_ok());
    }
}
