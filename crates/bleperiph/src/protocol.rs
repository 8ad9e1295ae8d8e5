//! GATT protocol constants and UUID helpers

use uuid::Uuid;

use crate::error::DefinitionError;

// ----------------------------------------------------------------------------
// Assigned Numbers
// ----------------------------------------------------------------------------

/// Bluetooth SIG base UUID, `0000xxxx-0000-1000-8000-00805F9B34FB`
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805F9B34FB);

/// Characteristic User Description descriptor (0x2901)
pub const USER_DESCRIPTION_UUID: Uuid = short_uuid(0x2901);

/// Client Characteristic Configuration descriptor (0x2902)
pub const CLIENT_CONFIGURATION_UUID: Uuid = short_uuid(0x2902);

/// Smallest max update value length a connection can have (ATT_MTU 23 minus the 3 byte header)
pub const MIN_MAX_UPDATE_LEN: usize = 20;

/// Largest value an attribute may hold
pub const MAX_ATTRIBUTE_LEN: usize = 512;

// ----------------------------------------------------------------------------
// Nordic UART Service
// ----------------------------------------------------------------------------

/// UART service UUID used by the demo applications
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// UART characteristic the central writes to
pub const UART_TX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// UART characteristic the peripheral notifies on
pub const UART_RX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

// ----------------------------------------------------------------------------
// UUID Helpers
// ----------------------------------------------------------------------------

/// Expand a 16-bit assigned number against the Bluetooth base UUID
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x00000000_0000_1000_8000_00805F9B34FB | ((short as u128) << 96))
}

/// Expand a 32-bit assigned number against the Bluetooth base UUID
pub const fn short_uuid32(short: u32) -> Uuid {
    Uuid::from_u128(0x00000000_0000_1000_8000_00805F9B34FB | ((short as u128) << 96))
}

/// Parse a UUID the way GATT definitions spell them.
///
/// Accepts 16-bit (`"2901"`) and 32-bit short forms as well as full 128-bit
/// UUIDs. Parsing is case-insensitive.
pub fn parse_uuid(value: &str) -> Result<Uuid, DefinitionError> {
    let trimmed = value.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    let invalid = || DefinitionError::InvalidUuid {
        value: value.to_string(),
    };

    match hex.len() {
        4 => u16::from_str_radix(hex, 16)
            .map(short_uuid)
            .map_err(|_| invalid()),
        8 => u32::from_str_radix(hex, 16)
            .map(short_uuid32)
            .map_err(|_| invalid()),
        _ => Uuid::parse_str(trimmed).map_err(|_| invalid()),
    }
}

/// Return the 16-bit assigned number if the UUID sits on the base UUID
pub fn as_short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let base = BLUETOOTH_BASE_UUID.as_u128();
    if value & !(0xFFFF_u128 << 96) == base && value >> 112 == 0 {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            USER_DESCRIPTION_UUID.to_string(),
            "00002901-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(as_short_uuid(&CLIENT_CONFIGURATION_UUID), Some(0x2902));
        assert_eq!(as_short_uuid(&UART_SERVICE_UUID), None);
    }

    #[test]
    fn test_parse_uuid_forms() {
        assert_eq!(parse_uuid("2901").unwrap(), USER_DESCRIPTION_UUID);
        assert_eq!(parse_uuid("0x2902").unwrap(), CLIENT_CONFIGURATION_UUID);
        assert_eq!(
            parse_uuid("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap(),
            UART_SERVICE_UUID
        );
        assert_eq!(
            parse_uuid("6E400001-B5A3-F393-E0A9-E50E24DCCA9E").unwrap(),
            UART_SERVICE_UUID
        );
        assert_eq!(
            parse_uuid("0000180D").unwrap(),
            short_uuid(0x180D)
        );
    }

    #[test]
    fn test_parse_uuid_rejects_garbage() {
        assert!(matches!(
            parse_uuid("not-a-uuid"),
            Err(DefinitionError::InvalidUuid { .. })
        ));
        assert!(parse_uuid("29G1").is_err());
    }
}
