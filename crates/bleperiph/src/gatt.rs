//! GATT data model: services, characteristics and descriptors

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DefinitionError;
use crate::protocol::{parse_uuid, MAX_ATTRIBUTE_LEN, USER_DESCRIPTION_UUID};

// ----------------------------------------------------------------------------
// Capability Tags
// ----------------------------------------------------------------------------

/// What a central may do with a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Property {
    Read,
    Write,
    WriteWithoutResponse,
    Notify,
    Indicate,
}

/// Access the attribute grants to the characteristic value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    Readable,
    Writeable,
}

/// Set of [`Property`] tags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties(BTreeSet<Property>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, property: Property) -> Self {
        self.0.insert(property);
        self
    }

    pub fn insert(&mut self, property: Property) {
        self.0.insert(property);
    }

    pub fn contains(&self, property: Property) -> bool {
        self.0.contains(&property)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Property> + '_ {
        self.0.iter().copied()
    }

    /// Either write flavour is present
    pub fn is_writable(&self) -> bool {
        self.contains(Property::Write) || self.contains(Property::WriteWithoutResponse)
    }

    /// Value changes can be pushed to subscribers
    pub fn can_push(&self) -> bool {
        self.contains(Property::Notify) || self.contains(Property::Indicate)
    }
}

impl FromIterator<Property> for Properties {
    fn from_iter<I: IntoIterator<Item = Property>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Set of [`Permission`] tags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions(BTreeSet<Permission>);

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, permission: Permission) -> Self {
        self.0.insert(permission);
        self
    }

    pub fn insert(&mut self, permission: Permission) {
        self.0.insert(permission);
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Permission> for Permissions {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ----------------------------------------------------------------------------
// Descriptor
// ----------------------------------------------------------------------------

/// Descriptor attached to a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

impl Descriptor {
    pub fn new(uuid: Uuid, value: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid,
            value: value.into(),
        }
    }

    /// Characteristic User Description (0x2901) carrying UTF-8 text
    pub fn user_description(text: &str) -> Self {
        Self::new(USER_DESCRIPTION_UUID, text.as_bytes().to_vec())
    }
}

// ----------------------------------------------------------------------------
// Characteristic
// ----------------------------------------------------------------------------

/// Addressable value within a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: Properties,
    pub permissions: Permissions,
    pub descriptors: Vec<Descriptor>,
    /// Cached value served to reads; may be empty
    pub value: Vec<u8>,
}

impl Characteristic {
    pub fn new(uuid: Uuid, properties: Properties, permissions: Permissions) -> Self {
        Self {
            uuid,
            properties,
            permissions,
            descriptors: Vec::new(),
            value: Vec::new(),
        }
    }

    pub fn builder(uuid: Uuid) -> CharacteristicBuilder {
        CharacteristicBuilder::new(uuid)
    }

    /// Check the property/permission combination and descriptor uniqueness
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let properties = &self.properties;
        if !(properties.contains(Property::Read) || properties.is_writable() || properties.can_push())
        {
            return Err(DefinitionError::UselessCharacteristic {
                characteristic: self.uuid,
            });
        }

        let required = [
            (Property::Read, Permission::Readable),
            (Property::Write, Permission::Writeable),
            (Property::WriteWithoutResponse, Permission::Writeable),
        ];
        for (property, permission) in required {
            if properties.contains(property) && !self.permissions.contains(permission) {
                return Err(DefinitionError::MissingPermission {
                    characteristic: self.uuid,
                    property,
                    permission,
                });
            }
        }

        if self.value.len() > MAX_ATTRIBUTE_LEN {
            return Err(DefinitionError::ValueTooLong {
                characteristic: self.uuid,
                len: self.value.len(),
                max: MAX_ATTRIBUTE_LEN,
            });
        }

        let mut seen = HashSet::new();
        for descriptor in &self.descriptors {
            if !seen.insert(descriptor.uuid) || descriptor.uuid == self.uuid {
                return Err(DefinitionError::DuplicateUuid {
                    service: self.uuid,
                    uuid: descriptor.uuid,
                });
            }
        }

        Ok(())
    }

    pub fn is_readable(&self) -> bool {
        self.properties.contains(Property::Read) && self.permissions.contains(Permission::Readable)
    }

    pub fn is_writable(&self) -> bool {
        self.properties.is_writable() && self.permissions.contains(Permission::Writeable)
    }
}

/// Builder mirroring the JSON-style definitions callers write
#[derive(Debug, Clone)]
pub struct CharacteristicBuilder {
    characteristic: Characteristic,
}

impl CharacteristicBuilder {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            characteristic: Characteristic::new(uuid, Properties::new(), Permissions::new()),
        }
    }

    /// Readable by centrals (READ + READABLE)
    pub fn read(mut self) -> Self {
        self.characteristic.properties.insert(Property::Read);
        self.characteristic.permissions.insert(Permission::Readable);
        self
    }

    /// Writable with response (WRITE + WRITEABLE)
    pub fn write(mut self) -> Self {
        self.characteristic.properties.insert(Property::Write);
        self.characteristic.permissions.insert(Permission::Writeable);
        self
    }

    /// Writable without response (WRITE_WITHOUT_RESPONSE + WRITEABLE)
    pub fn write_without_response(mut self) -> Self {
        self.characteristic
            .properties
            .insert(Property::WriteWithoutResponse);
        self.characteristic.permissions.insert(Permission::Writeable);
        self
    }

    pub fn notify(mut self) -> Self {
        self.characteristic.properties.insert(Property::Notify);
        self
    }

    pub fn indicate(mut self) -> Self {
        self.characteristic.properties.insert(Property::Indicate);
        self
    }

    /// Add a raw property tag without implying any permission
    pub fn property(mut self, property: Property) -> Self {
        self.characteristic.properties.insert(property);
        self
    }

    /// Add a raw permission tag
    pub fn permission(mut self, permission: Permission) -> Self {
        self.characteristic.permissions.insert(permission);
        self
    }

    pub fn descriptor(mut self, descriptor: Descriptor) -> Self {
        self.characteristic.descriptors.push(descriptor);
        self
    }

    pub fn description(self, text: &str) -> Self {
        self.descriptor(Descriptor::user_description(text))
    }

    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.characteristic.value = value.into();
        self
    }

    pub fn build(self) -> Characteristic {
        self.characteristic
    }
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

/// Service definition as handed to the registry and the native stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<Characteristic>,
}

impl ServiceDefinition {
    /// New primary service with no characteristics
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            characteristics: Vec::new(),
        }
    }

    pub fn secondary(mut self) -> Self {
        self.primary = false;
        self
    }

    pub fn with_characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }

    pub fn characteristic_mut(&mut self, uuid: &Uuid) -> Option<&mut Characteristic> {
        self.characteristics.iter_mut().find(|c| c.uuid == *uuid)
    }

    /// Validate every characteristic and UUID uniqueness within the service
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut seen = HashSet::from([self.uuid]);
        for characteristic in &self.characteristics {
            if !seen.insert(characteristic.uuid) {
                return Err(DefinitionError::DuplicateUuid {
                    service: self.uuid,
                    uuid: characteristic.uuid,
                });
            }
            characteristic.validate().map_err(|err| match err {
                DefinitionError::DuplicateUuid { uuid, .. } => DefinitionError::DuplicateUuid {
                    service: self.uuid,
                    uuid,
                },
                other => other,
            })?;
        }
        Ok(())
    }
}

/// Builds a validated [`ServiceDefinition`] from string UUIDs
#[derive(Debug, Clone)]
pub struct ServiceBuilder {
    service: Result<ServiceDefinition, DefinitionError>,
}

impl ServiceBuilder {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            service: Ok(ServiceDefinition::new(uuid)),
        }
    }

    /// Start from a UUID string such as `"180D"` or a full 128-bit form
    pub fn parse(uuid: &str) -> Self {
        Self {
            service: parse_uuid(uuid).map(ServiceDefinition::new),
        }
    }

    pub fn secondary(mut self) -> Self {
        if let Ok(service) = &mut self.service {
            service.primary = false;
        }
        self
    }

    pub fn characteristic(mut self, characteristic: Characteristic) -> Self {
        if let Ok(service) = &mut self.service {
            service.characteristics.push(characteristic);
        }
        self
    }

    /// Add a characteristic whose UUID is given as a string
    pub fn characteristic_with(
        mut self,
        uuid: &str,
        build: impl FnOnce(CharacteristicBuilder) -> CharacteristicBuilder,
    ) -> Self {
        self.service = self.service.and_then(|mut service| {
            let characteristic = build(CharacteristicBuilder::new(parse_uuid(uuid)?)).build();
            service.characteristics.push(characteristic);
            Ok(service)
        });
        self
    }

    /// Validate and return the definition
    pub fn build(self) -> Result<ServiceDefinition, DefinitionError> {
        let service = self.service?;
        service.validate()?;
        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{short_uuid, CLIENT_CONFIGURATION_UUID};

    fn uuid(n: u16) -> Uuid {
        short_uuid(n)
    }

    #[test]
    fn test_builder_sets_matching_permissions() {
        let characteristic = Characteristic::builder(uuid(0xA001))
            .read()
            .write()
            .notify()
            .description("Data Channel")
            .build();

        assert!(characteristic.is_readable());
        assert!(characteristic.is_writable());
        assert!(characteristic.properties.can_push());
        assert!(characteristic.validate().is_ok());
    }

    #[test]
    fn test_useless_characteristic_rejected() {
        let characteristic = Characteristic::builder(uuid(0xA001))
            .permission(Permission::Readable)
            .build();

        assert_eq!(
            characteristic.validate(),
            Err(DefinitionError::UselessCharacteristic {
                characteristic: uuid(0xA001)
            })
        );
    }

    #[test]
    fn test_notify_only_characteristic_is_valid() {
        let characteristic = Characteristic::builder(uuid(0xA001)).indicate().build();
        assert!(characteristic.validate().is_ok());
    }

    #[test]
    fn test_write_without_writeable_rejected() {
        let characteristic = Characteristic::builder(uuid(0xA001))
            .property(Property::Write)
            .build();

        assert!(matches!(
            characteristic.validate(),
            Err(DefinitionError::MissingPermission {
                property: Property::Write,
                permission: Permission::Writeable,
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_characteristic_in_service() {
        let service = ServiceDefinition::new(uuid(0x180D))
            .with_characteristic(Characteristic::builder(uuid(0xA001)).read().build())
            .with_characteristic(Characteristic::builder(uuid(0xA001)).write().build());

        assert_eq!(
            service.validate(),
            Err(DefinitionError::DuplicateUuid {
                service: uuid(0x180D),
                uuid: uuid(0xA001)
            })
        );
    }

    #[test]
    fn test_duplicate_descriptor_reports_service() {
        let service = ServiceDefinition::new(uuid(0x180D)).with_characteristic(
            Characteristic::builder(uuid(0xA001))
                .read()
                .descriptor(Descriptor::new(CLIENT_CONFIGURATION_UUID, vec![0, 0]))
                .descriptor(Descriptor::new(CLIENT_CONFIGURATION_UUID, vec![0, 0]))
                .build(),
        );

        assert_eq!(
            service.validate(),
            Err(DefinitionError::DuplicateUuid {
                service: uuid(0x180D),
                uuid: CLIENT_CONFIGURATION_UUID
            })
        );
    }

    #[test]
    fn test_same_descriptor_on_two_characteristics_is_fine() {
        let service = ServiceDefinition::new(uuid(0x180D))
            .with_characteristic(
                Characteristic::builder(uuid(0xA001))
                    .write()
                    .description("TX")
                    .build(),
            )
            .with_characteristic(
                Characteristic::builder(uuid(0xA002))
                    .read()
                    .notify()
                    .description("RX")
                    .build(),
            );

        assert!(service.validate().is_ok());
    }

    #[test]
    fn test_service_builder_from_strings() {
        let service = ServiceBuilder::parse("6E400001-B5A3-F393-E0A9-E50E24DCCA9E")
            .characteristic_with("6e400002-b5a3-f393-e0a9-e50e24dcca9e", |c| {
                c.write().write_without_response().description("TX")
            })
            .characteristic_with("6e400003-b5a3-f393-e0a9-e50e24dcca9e", |c| {
                c.read().notify().descriptor(Descriptor::new(
                    CLIENT_CONFIGURATION_UUID,
                    vec![0, 0],
                ))
            })
            .build()
            .unwrap();

        assert_eq!(service.uuid, crate::protocol::UART_SERVICE_UUID);
        assert!(service.primary);
        assert_eq!(service.characteristics.len(), 2);
    }

    #[test]
    fn test_service_builder_reports_bad_uuid() {
        let result = ServiceBuilder::parse("180D")
            .characteristic_with("zz", |c| c.read())
            .build();
        assert!(matches!(result, Err(DefinitionError::InvalidUuid { .. })));
    }
}
