//! MySQL client/server protocol messages.
//!
//! Reference: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basics.html

use crate::codec;
use crate::error::{MysqlError, MysqlResult};

// Capability flags (subset this client speaks).
pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;

pub const UTF8MB4_GENERAL_CI: u8 = 45;
pub const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// First-byte markers of server packets.
pub const OK_MARKER: u8 = 0x00;
pub const NULL_MARKER: u8 = 0xfb;
pub const EOF_MARKER: u8 = 0xfe;
pub const ERR_MARKER: u8 = 0xff;

/// Initial handshake (protocol version 10) sent by the server.
#[derive(Debug)]
pub struct HandshakeV10 {
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    /// Concatenated auth-plugin-data parts, trailing NUL stripped.
    pub auth_seed: Vec<u8>,
    pub auth_plugin: String,
}

impl HandshakeV10 {
    pub fn parse(payload: &[u8]) -> MysqlResult<Self> {
        let protocol_version = *payload
            .first()
            .ok_or_else(|| MysqlError::Protocol("empty handshake".into()))?;
        if protocol_version != 10 {
            return Err(MysqlError::Protocol(format!(
                "unsupported protocol version {protocol_version}"
            )));
        }

        let (version, pos) = codec::nul_str(payload, 1)
            .ok_or_else(|| MysqlError::Protocol("handshake missing server version".into()))?;
        let server_version = String::from_utf8_lossy(version).into_owned();

        let too_short = || MysqlError::Protocol("handshake truncated".into());

        let connection_id = u32::from_le_bytes(
            payload
                .get(pos..pos + 4)
                .ok_or_else(too_short)?
                .try_into()
                .unwrap_or([0; 4]),
        );
        let mut auth_seed = payload
            .get(pos + 4..pos + 12)
            .ok_or_else(too_short)?
            .to_vec();
        // 1 filler byte after the first seed chunk.
        let mut cursor = pos + 13;

        let cap_low = payload.get(cursor..cursor + 2).ok_or_else(too_short)?;
        let mut capabilities = u16::from_le_bytes([cap_low[0], cap_low[1]]) as u32;
        cursor += 2;

        let mut auth_data_len = 0usize;
        if payload.len() > cursor {
            // charset(1) + status(2)
            cursor += 3;
            let cap_high = payload.get(cursor..cursor + 2).ok_or_else(too_short)?;
            capabilities |= (u16::from_le_bytes([cap_high[0], cap_high[1]]) as u32) << 16;
            cursor += 2;

            auth_data_len = *payload.get(cursor).ok_or_else(too_short)? as usize;
            cursor += 1;
            // 10 reserved bytes
            cursor += 10;

            if capabilities & CLIENT_SECURE_CONNECTION != 0 {
                let part2_len = 13.max(auth_data_len.saturating_sub(8));
                let part2 = payload.get(cursor..cursor + part2_len).ok_or_else(too_short)?;
                auth_seed.extend_from_slice(part2);
                cursor += part2_len;
            }
        }
        while auth_seed.last() == Some(&0) {
            auth_seed.pop();
        }

        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            match codec::nul_str(payload, cursor) {
                Some((name, _)) => String::from_utf8_lossy(name).into_owned(),
                // Some servers omit the trailing NUL on the last field.
                None => String::from_utf8_lossy(payload.get(cursor..).unwrap_or(&[]))
                    .trim_end_matches('\0')
                    .to_string(),
            }
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };

        Ok(HandshakeV10 {
            server_version,
            connection_id,
            capabilities,
            auth_seed,
            auth_plugin,
        })
    }
}

/// HandshakeResponse41 payload.
pub fn build_handshake_response(
    user: &str,
    auth_response: &[u8],
    database: Option<&str>,
) -> Vec<u8> {
    let mut capabilities = CLIENT_LONG_PASSWORD
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH;
    if database.is_some() {
        capabilities |= CLIENT_CONNECT_WITH_DB;
    }

    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(&capabilities.to_le_bytes());
    out.extend_from_slice(&MAX_PACKET_SIZE.to_le_bytes());
    out.push(UTF8MB4_GENERAL_CI);
    out.extend_from_slice(&[0u8; 23]);
    out.extend_from_slice(user.as_bytes());
    out.push(0);
    out.push(auth_response.len() as u8);
    out.extend_from_slice(auth_response);
    if let Some(db) = database {
        out.extend_from_slice(db.as_bytes());
        out.push(0);
    }
    out.extend_from_slice(NATIVE_PASSWORD_PLUGIN.as_bytes());
    out.push(0);
    out
}

pub fn build_com_query(sql: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + sql.len());
    out.push(COM_QUERY);
    out.extend_from_slice(sql.as_bytes());
    out
}

#[derive(Debug, Clone, Copy)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
}

pub fn parse_ok(payload: &[u8]) -> MysqlResult<OkPacket> {
    if payload.first() != Some(&OK_MARKER) {
        return Err(MysqlError::Protocol("not an OK packet".into()));
    }
    let (affected_rows, pos) = codec::lenenc_int(payload, 1)
        .ok_or_else(|| MysqlError::Protocol("truncated OK packet".into()))?;
    let (last_insert_id, _) = codec::lenenc_int(payload, pos)
        .ok_or_else(|| MysqlError::Protocol("truncated OK packet".into()))?;
    Ok(OkPacket {
        affected_rows,
        last_insert_id,
    })
}

pub fn parse_err(payload: &[u8]) -> MysqlError {
    if payload.first() != Some(&ERR_MARKER) || payload.len() < 3 {
        return MysqlError::Protocol("malformed ERR packet".into());
    }
    let code = u16::from_le_bytes([payload[1], payload[2]]);
    let mut pos = 3;
    let mut state = String::new();
    if payload.get(pos) == Some(&b'#') {
        state = String::from_utf8_lossy(payload.get(pos + 1..pos + 6).unwrap_or(&[]))
            .into_owned();
        pos += 6;
    }
    let message = String::from_utf8_lossy(payload.get(pos..).unwrap_or(&[])).into_owned();
    MysqlError::Server {
        code,
        state,
        message,
    }
}

/// EOF packets are 0xfe with fewer than 9 payload bytes; longer 0xfe
/// packets are auth-switch requests.
pub fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_MARKER) && payload.len() < 9
}

#[derive(Debug)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub seed: Vec<u8>,
}

pub fn parse_auth_switch(payload: &[u8]) -> MysqlResult<AuthSwitchRequest> {
    if payload.first() != Some(&EOF_MARKER) {
        return Err(MysqlError::Protocol("not an auth switch packet".into()));
    }
    let (plugin, pos) = codec::nul_str(payload, 1)
        .ok_or_else(|| MysqlError::Protocol("truncated auth switch".into()))?;
    let mut seed = payload.get(pos..).unwrap_or(&[]).to_vec();
    while seed.last() == Some(&0) {
        seed.pop();
    }
    Ok(AuthSwitchRequest {
        plugin: String::from_utf8_lossy(plugin).into_owned(),
        seed,
    })
}

/// Column name from a ColumnDefinition41 payload (5th length-encoded
/// string: catalog, schema, table, org_table, name).
pub fn parse_column_name(payload: &[u8]) -> MysqlResult<String> {
    let mut pos = 0;
    let mut name = Vec::new();
    for i in 0..5 {
        let (bytes, next) = codec::lenenc_bytes(payload, pos)
            .ok_or_else(|| MysqlError::Protocol("truncated column definition".into()))?;
        if i == 4 {
            name = bytes.to_vec();
        }
        pos = next;
    }
    Ok(String::from_utf8_lossy(&name).into_owned())
}

/// One text-protocol row: a cell per column, NULL cells (0xfb) absent.
pub fn parse_text_row(payload: &[u8], columns: usize) -> MysqlResult<Vec<Option<Vec<u8>>>> {
    let mut values = Vec::with_capacity(columns);
    let mut pos = 0;
    for _ in 0..columns {
        if payload.get(pos) == Some(&NULL_MARKER) {
            values.push(None);
            pos += 1;
            continue;
        }
        let (bytes, next) = codec::lenenc_bytes(payload, pos)
            .ok_or_else(|| MysqlError::Protocol("truncated row".into()))?;
        values.push(Some(bytes.to_vec()));
        pos = next;
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Handshake payload as a MySQL 8 server would send it.
    pub(crate) fn sample_handshake(seed1: &[u8; 8], seed2: &[u8; 12]) -> Vec<u8> {
        let caps: u32 = CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH
            | CLIENT_TRANSACTIONS;

        let mut payload = vec![10u8];
        payload.extend_from_slice(b"8.0.36-test\0");
        payload.extend_from_slice(&7u32.to_le_bytes());
        payload.extend_from_slice(seed1);
        payload.push(0);
        payload.extend_from_slice(&((caps & 0xffff) as u16).to_le_bytes());
        payload.push(UTF8MB4_GENERAL_CI);
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&(((caps >> 16) & 0xffff) as u16).to_le_bytes());
        payload.push(21);
        payload.extend_from_slice(&[0u8; 10]);
        payload.extend_from_slice(seed2);
        payload.push(0);
        payload.extend_from_slice(NATIVE_PASSWORD_PLUGIN.as_bytes());
        payload.push(0);
        payload
    }

    #[test]
    fn handshake_parses_seed_and_plugin() {
        let payload = sample_handshake(b"abcdefgh", b"ijklmnopqrst");
        let handshake = HandshakeV10::parse(&payload).unwrap();

        assert_eq!(handshake.server_version, "8.0.36-test");
        assert_eq!(handshake.connection_id, 7);
        assert_eq!(handshake.auth_seed, b"abcdefghijklmnopqrst");
        assert_eq!(handshake.auth_plugin, NATIVE_PASSWORD_PLUGIN);
        assert!(handshake.capabilities & CLIENT_PROTOCOL_41 != 0);
    }

    #[test]
    fn handshake_rejects_wrong_protocol() {
        assert!(HandshakeV10::parse(&[9, 0]).is_err());
        assert!(HandshakeV10::parse(&[]).is_err());
    }

    #[test]
    fn ok_packet_carries_affected_rows() {
        let payload = [OK_MARKER, 0x03, 0x00, 0x02, 0x00, 0x00, 0x00];
        let ok = parse_ok(&payload).unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.last_insert_id, 0);
    }

    #[test]
    fn err_packet_surfaces_code_and_message() {
        let mut payload = vec![ERR_MARKER, 0x28, 0x04, b'#'];
        payload.extend_from_slice(b"42000");
        payload.extend_from_slice(b"You have an error in your SQL syntax");
        let err = parse_err(&payload);
        match err {
            MysqlError::Server {
                code,
                state,
                message,
            } => {
                assert_eq!(code, 1064);
                assert_eq!(state, "42000");
                assert!(message.starts_with("You have an error"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn eof_versus_auth_switch() {
        assert!(is_eof(&[EOF_MARKER, 0, 0, 2, 0]));

        let mut switch = vec![EOF_MARKER];
        switch.extend_from_slice(NATIVE_PASSWORD_PLUGIN.as_bytes());
        switch.push(0);
        switch.extend_from_slice(b"freshseed12345678901");
        assert!(!is_eof(&switch));
        let parsed = parse_auth_switch(&switch).unwrap();
        assert_eq!(parsed.plugin, NATIVE_PASSWORD_PLUGIN);
        assert_eq!(parsed.seed, b"freshseed12345678901");
    }

    #[test]
    fn column_definition_name() {
        let mut payload = Vec::new();
        for field in [&b"def"[..], b"db", b"users", b"users", b"login", b"login"] {
            crate::codec::put_lenenc_bytes(&mut payload, field);
        }
        payload.push(0x0c);
        payload.extend_from_slice(&45u16.to_le_bytes());
        payload.extend_from_slice(&255u32.to_le_bytes());
        payload.push(0xfd);
        payload.extend_from_slice(&[0, 0, 0, 0, 0]);
        assert_eq!(parse_column_name(&payload).unwrap(), "login");
    }

    #[test]
    fn text_row_with_null_cell() {
        let mut payload = Vec::new();
        crate::codec::put_lenenc_bytes(&mut payload, b"octocat");
        payload.push(NULL_MARKER);
        crate::codec::put_lenenc_bytes(&mut payload, b"8");

        let row = parse_text_row(&payload, 3).unwrap();
        assert_eq!(row[0].as_deref(), Some(&b"octocat"[..]));
        assert_eq!(row[1], None);
        assert_eq!(row[2].as_deref(), Some(&b"8"[..]));
    }

    #[test]
    fn handshake_response_layout() {
        let payload = build_handshake_response("app", b"01234567890123456789", Some("minuet"));
        assert_eq!(&payload[4..8], &MAX_PACKET_SIZE.to_le_bytes());
        assert_eq!(payload[8], UTF8MB4_GENERAL_CI);

        let user_start = 4 + 4 + 1 + 23;
        assert_eq!(&payload[user_start..user_start + 3], b"app");
        assert_eq!(payload[user_start + 3], 0);
        assert_eq!(payload[user_start + 4], 20);
        let caps = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        assert!(caps & CLIENT_CONNECT_WITH_DB != 0);
        assert!(caps & CLIENT_PLUGIN_AUTH != 0);
        assert!(payload.ends_with(b"mysql_native_password\0"));
    }
}
