use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

// max packet payload length; larger payloads are split across packets.
// see: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;

/// Protocol version byte every server greeting starts with.
pub const GREETING_PROTOCOL_VERSION: u8 = 0x0a;

/// High bit of the two-byte parameter type word marks UNSIGNED.
pub const PARAM_UNSIGNED_FLAG: u8 = 0x80;

#[derive(Debug, PartialEq, ToPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum HeaderInfo {
    OKHeader = 0x00,
    ErrHeader = 0xff,
    EOFHeader = 0xfe,
    LocalInFileHeader = 0xfb,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterSlave,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComEnd,
}

/// Two-byte type word of a binary-protocol parameter or column,
/// low byte only; the high byte carries the unsigned flag.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0a,
    Time = 0x0b,
    DateTime = 0x0c,
    Year = 0x0d,
    VarChar = 0x0f,
    Bit = 0x10,
    Json = 0xf5,
    NewDecimal = 0xf6,
    Enum = 0xf7,
    Set = 0xf8,
    TinyBlob = 0xf9,
    MediumBlob = 0xfa,
    LongBlob = 0xfb,
    Blob = 0xfc,
    VarString = 0xfd,
    String = 0xfe,
    Geometry = 0xff,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn command_codes_match_wire_values() {
        assert_eq!(CommandCode::from_u8(0x03), Some(CommandCode::ComQuery));
        assert_eq!(CommandCode::from_u8(0x16), Some(CommandCode::ComStmtPrepare));
        assert_eq!(CommandCode::from_u8(0x17), Some(CommandCode::ComStmtExecute));
        assert_eq!(CommandCode::from_u8(0x19), Some(CommandCode::ComStmtClose));
        assert_eq!(CommandCode::from_u8(0x1f), Some(CommandCode::ComResetConnection));
    }

    #[test]
    fn field_types_match_wire_values() {
        assert_eq!(FieldType::from_u8(0x03), Some(FieldType::Long));
        assert_eq!(FieldType::from_u8(0x08), Some(FieldType::LongLong));
        assert_eq!(FieldType::from_u8(0xf5), Some(FieldType::Json));
        assert_eq!(FieldType::from_u8(0xfd), Some(FieldType::VarString));
    }
}
