//! LMP opcode numbers and names

/// Extended opcodes are keyed as `EXT_OPCODE | ext`
pub const EXT_OPCODE: u16 = 0x100;

pub const NAME_REQ: u8 = 1;
pub const NAME_RES: u8 = 2;
pub const ACCEPTED: u8 = 3;
pub const NOT_ACCEPTED: u8 = 4;
pub const CLKOFFSET_REQ: u8 = 5;
pub const CLKOFFSET_RES: u8 = 6;
pub const DETACH: u8 = 7;
pub const IN_RAND: u8 = 8;
pub const COMB_KEY: u8 = 9;
pub const UNIT_KEY: u8 = 10;
pub const AU_RAND: u8 = 11;
pub const SRES: u8 = 12;
pub const TEMP_RAND: u8 = 13;
pub const TEMP_KEY: u8 = 14;
pub const ENCRYPTION_MODE_REQ: u8 = 15;
pub const ENCRYPTION_KEY_SIZE_REQ: u8 = 16;
pub const START_ENCRYPTION_REQ: u8 = 17;
pub const STOP_ENCRYPTION_REQ: u8 = 18;
pub const SWITCH_REQ: u8 = 19;
pub const HOLD: u8 = 20;
pub const HOLD_REQ: u8 = 21;
pub const SNIFF: u8 = 22;
pub const SNIFF_REQ: u8 = 23;
pub const UNSNIFF_REQ: u8 = 24;
pub const PARK_REQ: u8 = 25;
pub const SET_BROADCAST_SCAN_WINDOW: u8 = 27;
pub const MODIFY_BEACON: u8 = 28;
pub const UNPARK_BD_ADDR_REQ: u8 = 29;
pub const UNPARK_PM_ADDR_REQ: u8 = 30;
pub const POWER_CONTROL_REQ: u8 = 31;
pub const POWER_CONTROL_RES: u8 = 32;
pub const MAX_POWER: u8 = 33;
pub const MIN_POWER: u8 = 34;
pub const AUTO_RATE: u8 = 35;
pub const PREFERRED_RATE: u8 = 36;
pub const VERSION_REQ: u8 = 37;
pub const VERSION_RES: u8 = 38;
pub const FEATURES_REQ: u8 = 39;
pub const FEATURES_RES: u8 = 40;
pub const QUALITY_OF_SERVICE: u8 = 41;
pub const QUALITY_OF_SERVICE_REQ: u8 = 42;
pub const SCO_LINK_REQ: u8 = 43;
pub const REMOVE_SCO_LINK_REQ: u8 = 44;
pub const MAX_SLOT: u8 = 45;
pub const MAX_SLOT_REQ: u8 = 46;
pub const TIMING_ACCURACY_REQ: u8 = 47;
pub const TIMING_ACCURACY_RES: u8 = 48;
pub const SETUP_COMPLETE: u8 = 49;
pub const USE_SEMI_PERMANENT_KEY: u8 = 50;
pub const HOST_CONNECTION_REQ: u8 = 51;
pub const SLOT_OFFSET: u8 = 52;
pub const PAGE_MODE_REQ: u8 = 53;
pub const PAGE_SCAN_MODE_REQ: u8 = 54;
pub const SUPERVISION_TIMEOUT: u8 = 55;
pub const TEST_ACTIVATE: u8 = 56;
pub const TEST_CONTROL: u8 = 57;
pub const ENCRYPTION_KEY_SIZE_MASK_REQ: u8 = 58;
pub const ENCRYPTION_KEY_SIZE_MASK_RES: u8 = 59;
pub const SET_AFH: u8 = 60;
pub const ENCAPSULATED_HEADER: u8 = 61;
pub const ENCAPSULATED_PAYLOAD: u8 = 62;
pub const SIMPLE_PAIRING_CONFIRM: u8 = 63;
pub const SIMPLE_PAIRING_NUMBER: u8 = 64;
pub const DHKEY_CHECK: u8 = 65;
pub const ESCAPE_1: u8 = 124;
pub const ESCAPE_2: u8 = 125;
pub const ESCAPE_3: u8 = 126;
pub const ESCAPE_4: u8 = 127;

/// Extended opcodes, carried after `ESCAPE_4`
pub mod ext {
    pub const ACCEPTED_EXT: u8 = 1;
    pub const NOT_ACCEPTED_EXT: u8 = 2;
    pub const FEATURES_REQ_EXT: u8 = 3;
    pub const FEATURES_RES_EXT: u8 = 4;
    pub const CLK_ADJ: u8 = 5;
    pub const PACKET_TYPE_TABLE_REQ: u8 = 11;
    pub const ESCO_LINK_REQ: u8 = 12;
    pub const REMOVE_ESCO_LINK_REQ: u8 = 13;
    pub const CHANNEL_CLASSIFICATION_REQ: u8 = 16;
    pub const CHANNEL_CLASSIFICATION: u8 = 17;
    pub const SNIFF_SUBRATING_REQ: u8 = 21;
    pub const SNIFF_SUBRATING_RES: u8 = 22;
    pub const PAUSE_ENCRYPTION_REQ: u8 = 23;
    pub const RESUME_ENCRYPTION_REQ: u8 = 24;
    pub const IO_CAPABILITY_REQ: u8 = 25;
    pub const IO_CAPABILITY_RES: u8 = 26;
    pub const NUMERIC_COMPARISON_FAILED: u8 = 27;
    pub const PASSKEY_FAILED: u8 = 28;
    pub const OOB_FAILED: u8 = 29;
    pub const KEYPRESS_NOTIFICATION: u8 = 30;
    pub const POWER_CONTROL_INC: u8 = 31;
    pub const POWER_CONTROL_DEC: u8 = 32;
}

/// Name of a base opcode, or of an extended one when `EXT_OPCODE` is set
pub fn name(opcode: u16) -> Option<&'static str> {
    if opcode & EXT_OPCODE != 0 {
        return ext_name((opcode & 0xff) as u8);
    }
    let opcode = u8::try_from(opcode).ok()?;
    Some(match opcode {
        NAME_REQ => "LMP_NAME_REQ",
        NAME_RES => "LMP_NAME_RES",
        ACCEPTED => "LMP_ACCEPTED",
        NOT_ACCEPTED => "LMP_NOT_ACCEPTED",
        CLKOFFSET_REQ => "LMP_CLKOFFSET_REQ",
        CLKOFFSET_RES => "LMP_CLKOFFSET_RES",
        DETACH => "LMP_DETACH",
        IN_RAND => "LMP_IN_RAND",
        COMB_KEY => "LMP_COMB_KEY",
        UNIT_KEY => "LMP_UNIT_KEY",
        AU_RAND => "LMP_AU_RAND",
        SRES => "LMP_SRES",
        TEMP_RAND => "LMP_TEMP_RAND",
        TEMP_KEY => "LMP_TEMP_KEY",
        ENCRYPTION_MODE_REQ => "LMP_ENCRYPTION_MODE_REQ",
        ENCRYPTION_KEY_SIZE_REQ => "LMP_ENCRYPTION_KEY_SIZE_REQ",
        START_ENCRYPTION_REQ => "LMP_START_ENCRYPTION_REQ",
        STOP_ENCRYPTION_REQ => "LMP_STOP_ENCRYPTION_REQ",
        SWITCH_REQ => "LMP_SWITCH_REQ",
        HOLD => "LMP_HOLD",
        HOLD_REQ => "LMP_HOLD_REQ",
        SNIFF => "LMP_SNIFF",
        SNIFF_REQ => "LMP_SNIFF_REQ",
        UNSNIFF_REQ => "LMP_UNSNIFF_REQ",
        PARK_REQ => "LMP_PARK_REQ",
        SET_BROADCAST_SCAN_WINDOW => "LMP_SET_BROADCAST_SCAN_WINDOW",
        MODIFY_BEACON => "LMP_MODIFY_BEACON",
        UNPARK_BD_ADDR_REQ => "LMP_UNPARK_BD_ADDR_REQ",
        UNPARK_PM_ADDR_REQ => "LMP_UNPARK_PM_ADDR_REQ",
        POWER_CONTROL_REQ => "LMP_POWER_CONTROL_REQ",
        POWER_CONTROL_RES => "LMP_POWER_CONTROL_RES",
        MAX_POWER => "LMP_MAX_POWER",
        MIN_POWER => "LMP_MIN_POWER",
        AUTO_RATE => "LMP_AUTO_RATE",
        PREFERRED_RATE => "LMP_PREFERRED_RATE",
        VERSION_REQ => "LMP_VERSION_REQ",
        VERSION_RES => "LMP_VERSION_RES",
        FEATURES_REQ => "LMP_FEATURES_REQ",
        FEATURES_RES => "LMP_FEATURES_RES",
        QUALITY_OF_SERVICE => "LMP_QUALITY_OF_SERVICE",
        QUALITY_OF_SERVICE_REQ => "LMP_QUALITY_OF_SERVICE_REQ",
        SCO_LINK_REQ => "LMP_SCO_LINK_REQ",
        REMOVE_SCO_LINK_REQ => "LMP_REMOVE_SCO_LINK_REQ",
        MAX_SLOT => "LMP_MAX_SLOT",
        MAX_SLOT_REQ => "LMP_MAX_SLOT_REQ",
        TIMING_ACCURACY_REQ => "LMP_TIMING_ACCURACY_REQ",
        TIMING_ACCURACY_RES => "LMP_TIMING_ACCURACY_RES",
        SETUP_COMPLETE => "LMP_SETUP_COMPLETE",
        USE_SEMI_PERMANENT_KEY => "LMP_USE_SEMI_PERMANENT_KEY",
        HOST_CONNECTION_REQ => "LMP_HOST_CONNECTION_REQ",
        SLOT_OFFSET => "LMP_SLOT_OFFSET",
        PAGE_MODE_REQ => "LMP_PAGE_MODE_REQ",
        PAGE_SCAN_MODE_REQ => "LMP_PAGE_SCAN_MODE_REQ",
        SUPERVISION_TIMEOUT => "LMP_SUPERVISION_TIMEOUT",
        TEST_ACTIVATE => "LMP_TEST_ACTIVATE",
        TEST_CONTROL => "LMP_TEST_CONTROL",
        ENCRYPTION_KEY_SIZE_MASK_REQ => "LMP_ENCRYPTION_KEY_SIZE_MASK_REQ",
        ENCRYPTION_KEY_SIZE_MASK_RES => "LMP_ENCRYPTION_KEY_SIZE_MASK_RES",
        SET_AFH => "LMP_SET_AFH",
        ENCAPSULATED_HEADER => "LMP_ENCAPSULATED_HEADER",
        ENCAPSULATED_PAYLOAD => "LMP_ENCAPSULATED_PAYLOAD",
        SIMPLE_PAIRING_CONFIRM => "LMP_SIMPLE_PAIRING_CONFIRM",
        SIMPLE_PAIRING_NUMBER => "LMP_SIMPLE_PAIRING_NUMBER",
        DHKEY_CHECK => "LMP_DHKEY_CHECK",
        ESCAPE_1 => "LMP_ESCAPE_1",
        ESCAPE_2 => "LMP_ESCAPE_2",
        ESCAPE_3 => "LMP_ESCAPE_3",
        ESCAPE_4 => "LMP_ESCAPE_4",
        _ => return None,
    })
}

fn ext_name(opcode: u8) -> Option<&'static str> {
    Some(match opcode {
        ext::ACCEPTED_EXT => "LMP_ACCEPTED_EXT",
        ext::NOT_ACCEPTED_EXT => "LMP_NOT_ACCEPTED_EXT",
        ext::FEATURES_REQ_EXT => "LMP_FEATURES_REQ_EXT",
        ext::FEATURES_RES_EXT => "LMP_FEATURES_RES_EXT",
        ext::CLK_ADJ => "LMP_CLK_ADJ",
        ext::PACKET_TYPE_TABLE_REQ => "LMP_PACKET_TYPE_TABLE_REQ",
        ext::ESCO_LINK_REQ => "LMP_ESCO_LINK_REQ",
        ext::REMOVE_ESCO_LINK_REQ => "LMP_REMOVE_ESCO_LINK_REQ",
        ext::CHANNEL_CLASSIFICATION_REQ => "LMP_CHANNEL_CLASSIFICATION_REQ",
        ext::CHANNEL_CLASSIFICATION => "LMP_CHANNEL_CLASSIFICATION",
        ext::SNIFF_SUBRATING_REQ => "LMP_SNIFF_SUBRATING_REQ",
        ext::SNIFF_SUBRATING_RES => "LMP_SNIFF_SUBRATING_RES",
        ext::PAUSE_ENCRYPTION_REQ => "LMP_PAUSE_ENCRYPTION_REQ",
        ext::RESUME_ENCRYPTION_REQ => "LMP_RESUME_ENCRYPTION_REQ",
        ext::IO_CAPABILITY_REQ => "LMP_IO_CAPABILITY_REQ",
        ext::IO_CAPABILITY_RES => "LMP_IO_CAPABILITY_RES",
        ext::NUMERIC_COMPARISON_FAILED => "LMP_NUMERIC_COMPARISON_FAILED",
        ext::PASSKEY_FAILED => "LMP_PASSKEY_FAILED",
        ext::OOB_FAILED => "LMP_OOB_FAILED",
        ext::KEYPRESS_NOTIFICATION => "LMP_KEYPRESS_NOTIFICATION",
        ext::POWER_CONTROL_INC => "LMP_POWER_CONTROL_INC",
        ext::POWER_CONTROL_DEC => "LMP_POWER_CONTROL_DEC",
        _ => return None,
    })
}
