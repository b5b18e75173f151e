//! The six DIRCON opcode handlers (§4.5). Each takes the frame's seq_num
//! and raw payload, mutates `Server` state as needed, and returns the
//! response frame plus an optional follow-up notification.

use crate::gatt::{PROP_NOTIFY, PROP_READ, PROP_WRITE};
use crate::protocol::{Frame, MesgId, RespCode};
use crate::server::{PendingCpResponse, Server};
use crate::uuid::{well_known, Uuid128};

// Fitness Machine Feature bits (FTMS §4.3.1.1), little-endian u32.
const FM_FEAT_CADENCE: u32 = 0x0000_0002;
const FM_FEAT_HEART_RATE: u32 = 0x0000_0400;
const FM_FEAT_POWER_MEASUREMENT: u32 = 0x0000_4000;

// Target Setting Features bits.
const TS_FEAT_POWER_TARGET: u32 = 0x0000_0008;
const TS_FEAT_INDOOR_BIKE_SIM_PARAMS: u32 = 0x0000_2000;

/// Indoor Bike Data flags as emitted by this emulator: Instantaneous
/// Cadence present (bit 2) and Instantaneous Power present (bit 6). Heart
/// rate is always appended to the payload regardless of a flag bit, per
/// the literal wire layout this emulator reproduces.
const IBD_FLAGS: u16 = 0x0044;

// Fitness Machine Control Point opcodes (§4.5.4).
const FMCP_OP_REQUEST_CONTROL: u8 = 0x00;
const FMCP_OP_RESET: u8 = 0x01;
const FMCP_OP_SET_TARGET_POWER: u8 = 0x05;
const FMCP_OP_START_RESUME: u8 = 0x07;
const FMCP_OP_STOP_PAUSE: u8 = 0x08;
const FMCP_OP_SET_INDOOR_BIKE_SIM_PARAMS: u8 = 0x11;
const FMCP_OP_SET_WHEEL_CIRCUMFERENCE: u8 = 0x12;

// Control Point result codes.
const FMCP_RESULT_SUCCESS: u8 = 0x01;
const FMCP_RESULT_OP_CODE_NOT_SUPPORTED: u8 = 0x02;
const FMCP_RESULT_CONTROL_NOT_PERMITTED: u8 = 0x05;

const FMCP_RESPONSE_CODE: u8 = 0x80;

fn uuid16_of(table_lookup: Option<u16>) -> Option<u16> {
    table_lookup
}

/// §4.5.1: concatenate each Service's 128-bit UUID in insertion order.
pub fn handle_discover_services(server: &Server, seq: u8) -> Frame {
    let mut payload = Vec::with_capacity(16 * server.gatt_table.services.len());
    for svc in &server.gatt_table.services {
        payload.extend_from_slice(svc.uuid128.as_bytes());
    }
    Frame::new(MesgId::DiscoverServices, seq, RespCode::Success, payload)
}

/// §4.5.2.
pub fn handle_discover_characteristics(server: &Server, seq: u8, payload: &[u8]) -> Frame {
    let Some(service_uuid) = read_uuid128(payload) else {
        return Frame::new(MesgId::DiscoverCharacteristics, seq, RespCode::ServiceNotFound, vec![]);
    };

    match server.gatt_table.find_service(&service_uuid) {
        None => Frame::new(MesgId::DiscoverCharacteristics, seq, RespCode::ServiceNotFound, vec![]),
        Some(svc) => {
            let mut body = Vec::with_capacity(16 + svc.characteristics.len() * 17);
            body.extend_from_slice(svc.uuid128.as_bytes());
            for chr in &svc.characteristics {
                body.extend_from_slice(chr.uuid128.as_bytes());
                body.push(chr.properties);
            }
            Frame::new(MesgId::DiscoverCharacteristics, seq, RespCode::Success, body)
        }
    }
}

/// §4.5.3.
pub fn handle_read_characteristic(server: &Server, seq: u8, payload: &[u8]) -> Frame {
    let Some(chr_uuid) = read_uuid128(payload) else {
        return Frame::new(MesgId::ReadCharacteristic, seq, RespCode::CharacteristicNotFound, vec![]);
    };

    let Some((_, chr)) = server.gatt_table.find_characteristic(&chr_uuid) else {
        return Frame::new(MesgId::ReadCharacteristic, seq, RespCode::CharacteristicNotFound, vec![]);
    };

    if !chr.supports(PROP_READ) {
        return Frame::new(MesgId::ReadCharacteristic, seq, RespCode::CharacteristicOperationNotSupported, vec![]);
    }

    let uuid16 = chr.uuid16();
    let mut body = chr.uuid128.as_bytes().to_vec();

    if uuid16 == Some(well_known::FITNESS_MACHINE_FEATURE.0) {
        let fm_feat = FM_FEAT_CADENCE | FM_FEAT_HEART_RATE | FM_FEAT_POWER_MEASUREMENT;
        let ts_feat = TS_FEAT_POWER_TARGET | TS_FEAT_INDOOR_BIKE_SIM_PARAMS;
        body.extend_from_slice(&fm_feat.to_le_bytes());
        body.extend_from_slice(&ts_feat.to_le_bytes());
    } else if uuid16 == Some(well_known::SUPPORTED_POWER_RANGE.0) {
        body.extend_from_slice(&server.supported_power_range.min.to_le_bytes());
        body.extend_from_slice(&server.supported_power_range.max.to_le_bytes());
        body.extend_from_slice(&server.supported_power_range.inc.to_le_bytes());
    }
    // Other readable characteristics produce an empty-body success (§4.5.3: TBD placeholders).

    Frame::new(MesgId::ReadCharacteristic, seq, RespCode::Success, body)
}

/// §4.5.4. Returns the write response; the follow-up FMCP notification (if
/// any) is left staged in `server.pending_cp_response` for the frame loop
/// to emit after this response per §4.5.7 step 5.
pub fn handle_write_characteristic(server: &mut Server, seq: u8, payload: &[u8]) -> Frame {
    let Some(chr_uuid) = read_uuid128(payload) else {
        return Frame::new(MesgId::WriteCharacteristic, seq, RespCode::CharacteristicNotFound, vec![]);
    };
    let value = &payload[16.min(payload.len())..];

    let Some((_, chr)) = server.gatt_table.find_characteristic(&chr_uuid) else {
        return Frame::new(MesgId::WriteCharacteristic, seq, RespCode::CharacteristicNotFound, vec![]);
    };

    if !chr.supports(PROP_WRITE) {
        return Frame::new(MesgId::WriteCharacteristic, seq, RespCode::CharacteristicOperationNotSupported, vec![]);
    }

    let uuid16 = uuid16_of(chr.uuid16());

    if uuid16 == Some(well_known::FITNESS_MACHINE_CONTROL_POINT.0) {
        let (result, req_opcode) = dispatch_fmcp_write(server, value);
        server.activity_in_progress = true;
        server.pending_cp_response = Some(PendingCpResponse {
            chr_uuid16: well_known::FITNESS_MACHINE_CONTROL_POINT.0,
            req_opcode,
            result,
        });
        Frame::new(MesgId::WriteCharacteristic, seq, RespCode::Success, vec![])
    } else if uuid16 == Some(well_known::CYCLING_POWER_CONTROL_POINT.0) {
        // §4.5.4: other writable characteristics succeed with no side effects.
        Frame::new(MesgId::WriteCharacteristic, seq, RespCode::Success, vec![])
    } else {
        Frame::new(MesgId::WriteCharacteristic, seq, RespCode::UnexpectedError, vec![])
    }
}

/// Applies one FMCP opcode write to `server` state and returns
/// `(result_code, req_opcode)` for the scheduled notification body.
fn dispatch_fmcp_write(server: &mut Server, value: &[u8]) -> (u8, u8) {
    let Some(&opcode) = value.first() else {
        return (FMCP_RESULT_OP_CODE_NOT_SUPPORTED, 0);
    };

    if opcode != FMCP_OP_REQUEST_CONTROL && !server.control_granted {
        return (FMCP_RESULT_CONTROL_NOT_PERMITTED, opcode);
    }

    match opcode {
        FMCP_OP_REQUEST_CONTROL => {
            server.control_granted = true;
            (FMCP_RESULT_SUCCESS, opcode)
        }
        FMCP_OP_RESET => {
            server.control_granted = false;
            (FMCP_RESULT_SUCCESS, opcode)
        }
        FMCP_OP_SET_TARGET_POWER => (FMCP_RESULT_SUCCESS, opcode),
        FMCP_OP_START_RESUME => (FMCP_RESULT_SUCCESS, opcode),
        FMCP_OP_STOP_PAUSE => (FMCP_RESULT_SUCCESS, opcode),
        FMCP_OP_SET_INDOOR_BIKE_SIM_PARAMS => (FMCP_RESULT_SUCCESS, opcode),
        FMCP_OP_SET_WHEEL_CIRCUMFERENCE => (FMCP_RESULT_SUCCESS, opcode),
        _ => (FMCP_RESULT_OP_CODE_NOT_SUPPORTED, opcode),
    }
}

/// §4.5.5.
pub fn handle_enable_notifications(server: &mut Server, seq: u8, payload: &[u8]) -> Frame {
    let Some(chr_uuid) = read_uuid128(payload) else {
        return Frame::new(MesgId::EnableCharacteristicNotifications, seq, RespCode::CharacteristicNotFound, vec![]);
    };
    let enable = payload.get(16).map(|b| b & 0x01 != 0).unwrap_or(false);

    let Some((_, chr)) = server.gatt_table.find_characteristic(&chr_uuid) else {
        return Frame::new(MesgId::EnableCharacteristicNotifications, seq, RespCode::CharacteristicNotFound, vec![]);
    };

    if !chr.supports(PROP_NOTIFY) {
        return Frame::new(
            MesgId::EnableCharacteristicNotifications,
            seq,
            RespCode::CharacteristicOperationNotSupported,
            vec![],
        );
    }

    let uuid16 = chr.uuid16();
    if uuid16 == Some(well_known::INDOOR_BIKE_DATA.0) {
        server.session.ibd_notifications_enabled = enable;
        if enable {
            if server.session.next_notification_deadline.is_none() {
                server.session.next_notification_deadline =
                    Some(std::time::Instant::now() + std::time::Duration::from_secs(1));
            }
        } else {
            server.session.next_notification_deadline = None;
        }
    } else if uuid16 == Some(well_known::FITNESS_MACHINE_CONTROL_POINT.0) {
        server.session.fmcp_notifications_enabled = enable;
    }
    // Fitness-Machine-Status / Training-Status: purely event-driven in this
    // emulator, so enabling them only needs to be accepted, not tracked.

    let mut body = chr_uuid.as_bytes().to_vec();
    body.push(enable as u8);
    Frame::new(MesgId::EnableCharacteristicNotifications, seq, RespCode::Success, body)
}

/// §4.5.6, Indoor-Bike-Data half: builds the notification from the current
/// telemetry snapshot, advancing the activity queue if one is in progress.
pub fn build_ibd_notification(server: &mut Server, seq: u8) -> Frame {
    let now = server.monotonic_seconds();
    let sample = if server.activity_in_progress {
        server
            .telemetry_stream
            .as_mut()
            .and_then(|s| s.next_sample())
            .unwrap_or_else(|| server.config_telemetry.sample(now))
    } else {
        server.config_telemetry.sample(now)
    };

    let mut body = well_known_uuid128(well_known::INDOOR_BIKE_DATA.0);
    let mut payload = Vec::with_capacity(9);
    payload.extend_from_slice(&IBD_FLAGS.to_le_bytes());
    payload.extend_from_slice(&sample.speed.to_le_bytes());
    payload.extend_from_slice(&sample.cadence.to_le_bytes());
    payload.extend_from_slice(&sample.power.to_le_bytes());
    payload.push(sample.heart_rate);
    body.extend_from_slice(&payload);

    Frame::new(MesgId::UnsolicitedCharacteristicNotification, seq, RespCode::Success, body)
}

/// §4.5.6, FMCP half: the mandatory write-then-notify reply.
pub fn build_fmcp_notification(seq: u8, pending: &PendingCpResponse) -> Frame {
    let mut body = well_known_uuid128(pending.chr_uuid16);
    body.push(FMCP_RESPONSE_CODE);
    body.push(pending.req_opcode);
    body.push(pending.result);
    Frame::new(MesgId::UnsolicitedCharacteristicNotification, seq, RespCode::Success, body)
}

fn well_known_uuid128(uuid16: u16) -> Vec<u8> {
    Uuid128::from_u16(uuid16).as_bytes().to_vec()
}

fn read_uuid128(payload: &[u8]) -> Option<Uuid128> {
    let bytes: [u8; 16] = payload.get(0..16)?.try_into().ok()?;
    Some(Uuid128::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_server() -> Server {
        Server::new(Config::default_for_tests())
    }

    #[test]
    fn discover_services_lists_cps_then_ftms() {
        let server = test_server();
        let f = handle_discover_services(&server, 7);
        assert_eq!(f.resp_code, RespCode::Success.as_u8());
        assert_eq!(f.payload.len(), 32);
        assert_eq!(&f.payload[0..16], Uuid128::from_u16(well_known::CYCLING_POWER_SERVICE.0).as_bytes());
        assert_eq!(&f.payload[16..32], Uuid128::from_u16(well_known::FITNESS_MACHINE_SERVICE.0).as_bytes());
    }

    #[test]
    fn discover_characteristics_unknown_service() {
        let server = test_server();
        let body = Uuid128::from_u16(0xABCD).as_bytes().to_vec();
        let f = handle_discover_characteristics(&server, 8, &body);
        assert_eq!(f.resp_code, RespCode::ServiceNotFound.as_u8());
        assert!(f.payload.is_empty());
    }

    #[test]
    fn read_fitness_machine_feature_matches_literal() {
        let server = test_server();
        let body = Uuid128::from_u16(well_known::FITNESS_MACHINE_FEATURE.0).as_bytes().to_vec();
        let f = handle_read_characteristic(&server, 9, &body);
        assert_eq!(f.resp_code, RespCode::Success.as_u8());
        assert_eq!(f.payload.len(), 24);
        let fm_feat = u32::from_le_bytes(f.payload[16..20].try_into().unwrap());
        let ts_feat = u32::from_le_bytes(f.payload[20..24].try_into().unwrap());
        assert_eq!(fm_feat, 0x0000_4402);
        assert_eq!(ts_feat, 0x0000_2008);
    }

    #[test]
    fn read_unsupported_property_rejected() {
        let server = test_server();
        let body = Uuid128::from_u16(well_known::INDOOR_BIKE_DATA.0).as_bytes().to_vec();
        let f = handle_read_characteristic(&server, 1, &body);
        assert_eq!(f.resp_code, RespCode::CharacteristicOperationNotSupported.as_u8());
    }

    #[test]
    fn fmcp_gate_blocks_until_request_control() {
        let mut server = test_server();
        let mut body = Uuid128::from_u16(well_known::FITNESS_MACHINE_CONTROL_POINT.0).as_bytes().to_vec();
        body.push(FMCP_OP_SET_TARGET_POWER);
        body.push(200);
        let f = handle_write_characteristic(&mut server, 10, &body);
        assert_eq!(f.resp_code, RespCode::Success.as_u8());
        let pending = server.pending_cp_response.take().unwrap();
        assert_eq!(pending.result, FMCP_RESULT_CONTROL_NOT_PERMITTED);
        assert_eq!(pending.req_opcode, FMCP_OP_SET_TARGET_POWER);

        let mut grant_body = Uuid128::from_u16(well_known::FITNESS_MACHINE_CONTROL_POINT.0).as_bytes().to_vec();
        grant_body.push(FMCP_OP_REQUEST_CONTROL);
        let f2 = handle_write_characteristic(&mut server, 11, &grant_body);
        assert_eq!(f2.resp_code, RespCode::Success.as_u8());
        let pending2 = server.pending_cp_response.take().unwrap();
        assert_eq!(pending2.result, FMCP_RESULT_SUCCESS);
        assert!(server.control_granted);

        let f3 = handle_write_characteristic(&mut server, 12, &body);
        assert_eq!(f3.resp_code, RespCode::Success.as_u8());
        let pending3 = server.pending_cp_response.take().unwrap();
        assert_eq!(pending3.result, FMCP_RESULT_SUCCESS);
    }

    #[test]
    fn any_fmcp_write_arms_the_activity() {
        let mut server = test_server();
        assert!(!server.activity_in_progress);
        let mut body = Uuid128::from_u16(well_known::FITNESS_MACHINE_CONTROL_POINT.0).as_bytes().to_vec();
        body.push(FMCP_OP_SET_TARGET_POWER);
        body.push(200);
        handle_write_characteristic(&mut server, 1, &body);
        assert!(server.activity_in_progress);
    }

    #[test]
    fn write_unknown_characteristic_is_unexpected_error() {
        let mut server = test_server();
        let mut body = Uuid128::from_u16(well_known::SENSOR_LOCATION.0).as_bytes().to_vec();
        body.push(0x00);
        // SENSOR_LOCATION is read-only, so this exercises the property gate
        // rather than the unrecognized-writable-characteristic branch.
        let f = handle_write_characteristic(&mut server, 2, &body);
        assert_eq!(f.resp_code, RespCode::CharacteristicOperationNotSupported.as_u8());
    }

    #[test]
    fn enable_ibd_notifications_arms_deadline() {
        let mut server = test_server();
        let mut body = Uuid128::from_u16(well_known::INDOOR_BIKE_DATA.0).as_bytes().to_vec();
        body.push(0x01);
        let f = handle_enable_notifications(&mut server, 3, &body);
        assert_eq!(f.resp_code, RespCode::Success.as_u8());
        assert!(server.session.ibd_notifications_enabled);
        assert!(server.session.next_notification_deadline.is_some());

        body[16] = 0x00;
        handle_enable_notifications(&mut server, 4, &body);
        assert!(!server.session.ibd_notifications_enabled);
        assert!(server.session.next_notification_deadline.is_none());
    }

    #[test]
    fn ibd_notification_carries_literal_flags() {
        let mut server = test_server();
        let f = build_ibd_notification(&mut server, 0);
        let flags = u16::from_le_bytes(f.payload[16..18].try_into().unwrap());
        assert_eq!(flags, 0x0044);
        assert_eq!(f.payload.len(), 16 + 9);
    }
}
