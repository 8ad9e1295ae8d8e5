//! Service registry
//!
//! Catalog of defined services keyed by UUID. A service's structure can be
//! changed only while it is not published; cached characteristic values may
//! change at any time.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DefinitionError, PublishError};
use crate::gatt::{Characteristic, Permission, Property, ServiceDefinition};
use crate::protocol::MAX_ATTRIBUTE_LEN;

// ----------------------------------------------------------------------------
// Handles and States
// ----------------------------------------------------------------------------

/// Identity of a defined service; stable across publish calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub uuid: Uuid,
    pub id: u64,
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.uuid, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishState {
    Defined,
    Publishing { attempt: u64 },
    Published { published_at: SystemTime },
}

#[derive(Debug)]
struct ServiceEntry {
    handle: ServiceHandle,
    definition: ServiceDefinition,
    state: PublishState,
}

/// What the caller must do to satisfy a publish request
#[derive(Debug, Clone, PartialEq)]
pub enum PublishPlan {
    /// Already published; resolve immediately with the existing identity
    Published(ServiceHandle),
    /// A publish for this service is already waiting on the stack
    InFlight,
    /// Submit the frozen definition to the stack
    Submit {
        attempt: u64,
        definition: ServiceDefinition,
    },
}

/// Services affected by the radio going away
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PowerLossReset {
    /// Publishes that were waiting on the stack
    pub interrupted: Vec<Uuid>,
    /// Services that were published and are no longer
    pub reverted: Vec<Uuid>,
}

/// A characteristic together with its owning service
#[derive(Debug, Clone, Copy)]
pub struct CharacteristicRef<'a> {
    pub service: Uuid,
    pub characteristic: &'a Characteristic,
    pub published: bool,
}

// ----------------------------------------------------------------------------
// Summaries
// ----------------------------------------------------------------------------

/// Characteristic overview for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicSummary {
    pub uuid: Uuid,
    pub properties: Vec<Property>,
    pub permissions: Vec<Permission>,
    pub descriptors_count: usize,
    pub value_len: usize,
}

/// Service overview for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub uuid: Uuid,
    pub is_primary: bool,
    pub published: bool,
    pub characteristics: Vec<CharacteristicSummary>,
}

impl ServiceSummary {
    pub fn characteristics_count(&self) -> usize {
        self.characteristics.len()
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<Uuid, ServiceEntry>,
    /// Characteristic UUID to owning service
    owners: HashMap<Uuid, Uuid>,
    next_id: u64,
    next_attempt: u64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new service definition
    pub fn define(&mut self, definition: ServiceDefinition) -> Result<ServiceHandle, DefinitionError> {
        if self.services.contains_key(&definition.uuid) {
            return Err(DefinitionError::DuplicateService {
                service: definition.uuid,
            });
        }
        definition.validate()?;
        for characteristic in &definition.characteristics {
            self.check_unclaimed(definition.uuid, characteristic.uuid)?;
        }

        self.next_id += 1;
        let handle = ServiceHandle {
            uuid: definition.uuid,
            id: self.next_id,
        };
        for characteristic in &definition.characteristics {
            self.owners.insert(characteristic.uuid, definition.uuid);
        }
        debug!(
            "Defined service {} with {} characteristics",
            handle,
            definition.characteristics.len()
        );
        self.services.insert(
            definition.uuid,
            ServiceEntry {
                handle,
                definition,
                state: PublishState::Defined,
            },
        );
        Ok(handle)
    }

    /// Append a characteristic to a service that is not published
    pub fn add_characteristic(
        &mut self,
        service: Uuid,
        characteristic: Characteristic,
    ) -> Result<(), DefinitionError> {
        let entry = self
            .services
            .get(&service)
            .ok_or(DefinitionError::UnknownService { service })?;
        if entry.state != PublishState::Defined {
            return Err(DefinitionError::AlreadyPublished { service });
        }

        let mut candidate = entry.definition.clone();
        candidate.characteristics.push(characteristic.clone());
        candidate.validate()?;
        self.check_unclaimed(service, characteristic.uuid)?;

        self.owners.insert(characteristic.uuid, service);
        if let Some(entry) = self.services.get_mut(&service) {
            entry.definition.characteristics.push(characteristic);
        }
        Ok(())
    }

    fn check_unclaimed(&self, service: Uuid, characteristic: Uuid) -> Result<(), DefinitionError> {
        if self.owners.contains_key(&characteristic) || self.services.contains_key(&characteristic) {
            return Err(DefinitionError::DuplicateUuid {
                service,
                uuid: characteristic,
            });
        }
        Ok(())
    }

    /// Decide how to satisfy a publish request
    pub fn begin_publish(&mut self, service: Uuid) -> Result<PublishPlan, PublishError> {
        let entry = self
            .services
            .get_mut(&service)
            .ok_or(PublishError::UnknownService { service })?;
        match entry.state {
            PublishState::Published { .. } => Ok(PublishPlan::Published(entry.handle)),
            PublishState::Publishing { .. } => Ok(PublishPlan::InFlight),
            PublishState::Defined => {
                self.next_attempt += 1;
                let attempt = self.next_attempt;
                entry.state = PublishState::Publishing { attempt };
                Ok(PublishPlan::Submit {
                    attempt,
                    definition: entry.definition.clone(),
                })
            }
        }
    }

    /// Apply the stack's answer to a publish attempt.
    ///
    /// Returns `None` when the attempt is stale (superseded by a power loss).
    pub fn finish_publish(
        &mut self,
        service: Uuid,
        attempt: u64,
        succeeded: bool,
    ) -> Option<ServiceHandle> {
        let entry = self.services.get_mut(&service)?;
        if entry.state != (PublishState::Publishing { attempt }) {
            return None;
        }
        entry.state = if succeeded {
            PublishState::Published {
                published_at: SystemTime::now(),
            }
        } else {
            PublishState::Defined
        };
        Some(entry.handle)
    }

    /// Make a published service mutable again.
    ///
    /// Returns the characteristic UUIDs that went away, or `None` when the
    /// service was not published.
    pub fn unpublish(&mut self, service: Uuid) -> Result<Option<Vec<Uuid>>, PublishError> {
        let entry = self
            .services
            .get_mut(&service)
            .ok_or(PublishError::UnknownService { service })?;
        match entry.state {
            PublishState::Defined => Ok(None),
            PublishState::Publishing { .. } => Err(PublishError::InProgress { service }),
            PublishState::Published { .. } => {
                entry.state = PublishState::Defined;
                Ok(Some(
                    entry
                        .definition
                        .characteristics
                        .iter()
                        .map(|c| c.uuid)
                        .collect(),
                ))
            }
        }
    }

    /// The stack dropped its GATT database; nothing is published anymore
    pub fn reset_published(&mut self) -> PowerLossReset {
        let mut reset = PowerLossReset::default();
        for (uuid, entry) in self.services.iter_mut() {
            match entry.state {
                PublishState::Publishing { .. } => reset.interrupted.push(*uuid),
                PublishState::Published { .. } => reset.reverted.push(*uuid),
                PublishState::Defined => continue,
            }
            entry.state = PublishState::Defined;
        }
        reset
    }

    /// Replace the cached value of a characteristic
    pub fn set_value(&mut self, characteristic: Uuid, value: Vec<u8>) -> Result<(), DefinitionError> {
        if value.len() > MAX_ATTRIBUTE_LEN {
            return Err(DefinitionError::ValueTooLong {
                characteristic,
                len: value.len(),
                max: MAX_ATTRIBUTE_LEN,
            });
        }
        let target = self
            .characteristic_mut(&characteristic)
            .ok_or(DefinitionError::UnknownCharacteristic { characteristic })?;
        target.value = value;
        Ok(())
    }

    fn characteristic_mut(&mut self, characteristic: &Uuid) -> Option<&mut Characteristic> {
        let service = self.owners.get(characteristic)?;
        self.services
            .get_mut(service)?
            .definition
            .characteristic_mut(characteristic)
    }

    pub fn lookup(&self, characteristic: &Uuid) -> Option<CharacteristicRef<'_>> {
        let service = self.owners.get(characteristic)?;
        let entry = self.services.get(service)?;
        Some(CharacteristicRef {
            service: *service,
            characteristic: entry.definition.characteristic(characteristic)?,
            published: matches!(entry.state, PublishState::Published { .. }),
        })
    }

    pub fn is_published(&self, service: &Uuid) -> bool {
        self.services
            .get(service)
            .map(|entry| matches!(entry.state, PublishState::Published { .. }))
            .unwrap_or(false)
    }

    pub fn definition(&self, service: &Uuid) -> Option<&ServiceDefinition> {
        self.services.get(service).map(|entry| &entry.definition)
    }

    pub fn summaries(&self) -> Vec<ServiceSummary> {
        self.services
            .values()
            .map(|entry| ServiceSummary {
                uuid: entry.handle.uuid,
                is_primary: entry.definition.primary,
                published: matches!(entry.state, PublishState::Published { .. }),
                characteristics: entry
                    .definition
                    .characteristics
                    .iter()
                    .map(|c| CharacteristicSummary {
                        uuid: c.uuid,
                        properties: c.properties.iter().collect(),
                        permissions: c.permissions.iter().collect(),
                        descriptors_count: c.descriptors.len(),
                        value_len: c.value.len(),
                    })
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::short_uuid;

    fn service(n: u16, characteristic: u16) -> ServiceDefinition {
        ServiceDefinition::new(short_uuid(n)).with_characteristic(
            Characteristic::builder(short_uuid(characteristic))
                .write()
                .build(),
        )
    }

    fn submit(registry: &mut ServiceRegistry, uuid: Uuid) -> u64 {
        match registry.begin_publish(uuid).unwrap() {
            PublishPlan::Submit { attempt, .. } => attempt,
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.define(service(0x1800, 0xA001)).unwrap();
        assert_eq!(
            registry.define(service(0x1800, 0xA002)),
            Err(DefinitionError::DuplicateService {
                service: short_uuid(0x1800)
            })
        );
    }

    #[test]
    fn test_characteristic_uuid_unique_across_services() {
        let mut registry = ServiceRegistry::new();
        registry.define(service(0x1800, 0xA001)).unwrap();
        assert!(matches!(
            registry.define(service(0x1801, 0xA001)),
            Err(DefinitionError::DuplicateUuid { .. })
        ));
    }

    #[test]
    fn test_publish_is_idempotent() {
        let mut registry = ServiceRegistry::new();
        let handle = registry.define(service(0x1800, 0xA001)).unwrap();
        let attempt = submit(&mut registry, handle.uuid);

        assert_eq!(registry.begin_publish(handle.uuid).unwrap(), PublishPlan::InFlight);
        assert_eq!(registry.finish_publish(handle.uuid, attempt, true), Some(handle));
        assert_eq!(
            registry.begin_publish(handle.uuid).unwrap(),
            PublishPlan::Published(handle)
        );
        assert!(registry.is_published(&handle.uuid));
    }

    #[test]
    fn test_rejected_publish_leaves_service_mutable() {
        let mut registry = ServiceRegistry::new();
        let handle = registry.define(service(0x1800, 0xA001)).unwrap();
        let attempt = submit(&mut registry, handle.uuid);
        registry.finish_publish(handle.uuid, attempt, false);

        assert!(!registry.is_published(&handle.uuid));
        registry
            .add_characteristic(
                handle.uuid,
                Characteristic::builder(short_uuid(0xA002)).read().build(),
            )
            .unwrap();
        assert_eq!(registry.definition(&handle.uuid).unwrap().characteristics.len(), 2);
    }

    #[test]
    fn test_structure_frozen_after_publish() {
        let mut registry = ServiceRegistry::new();
        let handle = registry.define(service(0x1800, 0xA001)).unwrap();
        let attempt = submit(&mut registry, handle.uuid);
        registry.finish_publish(handle.uuid, attempt, true);

        let result = registry.add_characteristic(
            handle.uuid,
            Characteristic::builder(short_uuid(0xA002)).read().build(),
        );
        assert_eq!(
            result,
            Err(DefinitionError::AlreadyPublished {
                service: handle.uuid
            })
        );

        registry.set_value(short_uuid(0xA001), b"ok".to_vec()).unwrap();
        assert_eq!(registry.lookup(&short_uuid(0xA001)).unwrap().characteristic.value, b"ok");
    }

    #[test]
    fn test_stale_completion_after_power_loss() {
        let mut registry = ServiceRegistry::new();
        let handle = registry.define(service(0x1800, 0xA001)).unwrap();
        let attempt = submit(&mut registry, handle.uuid);

        let reset = registry.reset_published();
        assert_eq!(reset.interrupted, vec![handle.uuid]);
        assert_eq!(registry.finish_publish(handle.uuid, attempt, true), None);
        assert!(!registry.is_published(&handle.uuid));
    }

    #[test]
    fn test_unpublish_returns_characteristics() {
        let mut registry = ServiceRegistry::new();
        let handle = registry.define(service(0x1800, 0xA001)).unwrap();
        assert_eq!(registry.unpublish(handle.uuid), Ok(None));

        let attempt = submit(&mut registry, handle.uuid);
        assert_eq!(
            registry.unpublish(handle.uuid),
            Err(PublishError::InProgress {
                service: handle.uuid
            })
        );
        registry.finish_publish(handle.uuid, attempt, true);
        assert_eq!(
            registry.unpublish(handle.uuid),
            Ok(Some(vec![short_uuid(0xA001)]))
        );
        assert!(!registry.is_published(&handle.uuid));
    }

    #[test]
    fn test_value_length_bounded() {
        let mut registry = ServiceRegistry::new();
        registry.define(service(0x1800, 0xA001)).unwrap();
        assert!(matches!(
            registry.set_value(short_uuid(0xA001), vec![0; MAX_ATTRIBUTE_LEN + 1]),
            Err(DefinitionError::ValueTooLong { .. })
        ));
        assert_eq!(
            registry.set_value(short_uuid(0xB000), vec![]),
            Err(DefinitionError::UnknownCharacteristic {
                characteristic: short_uuid(0xB000)
            })
        );
    }
}
