#![no_main]

use chrono::{DateTime, TimeZone, Utc};
use grantcheck_engine::builtin_registry;
use grantcheck_engine::config::EngineConfig;
use grantcheck_engine::dispatcher::{FlowDispatcher, StepInput};
use grantcheck_engine::grant::GrantType;
use grantcheck_engine::session::{Direction, FlowSession, TransportScheme};
use libfuzzer_sys::fuzz_target;

const MAX_STEPS: usize = 96;
const MAX_PARAMS: usize = 8;

const STEP_NAMES: [&str; 11] = [
    "authorization_request",
    "user_authentication",
    "authorization_response",
    "fragment_response",
    "token_request",
    "token_response",
    "device_authorization_request",
    "device_authorization_response",
    "token_poll",
    "token_poll_response",
    "unrecognized_step",
];

const PARAM_KEYS: [&str; 16] = [
    "response_type",
    "client_id",
    "client_secret",
    "redirect_uri",
    "scope",
    "state",
    "code",
    "code_challenge",
    "code_challenge_method",
    "code_verifier",
    "grant_type",
    "access_token",
    "token_type",
    "expires_in",
    "error",
    "status",
];

const PARAM_VALUES: [&str; 12] = [
    "code",
    "token",
    "S256",
    "plain",
    "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk",
    "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM",
    "authorization_code",
    "client_credentials",
    "urn:ietf:params:oauth:grant-type:device_code",
    "invalid_grant",
    "Bearer",
    "https://client.example.org/callback",
];

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    run_flow_program(data);
});

fn run_flow_program(data: &[u8]) {
    let config =
        EngineConfig::default().with_registered_redirect_uri("https://client.example.org/callback");
    let Ok(registry) = builtin_registry(&config) else {
        return;
    };
    let mut dispatcher = FlowDispatcher::new(&registry);

    let mut flow_a = FlowSession::new(grant(byte(data, 0)), t(0));
    let mut flow_b = FlowSession::new(grant(byte(data, 1)), t(0));

    let mut now: i64 = 1;
    let mut cursor = 2usize;
    for _ in 0..MAX_STEPS {
        let opcode = byte(data, cursor);
        cursor = cursor.saturating_add(1);

        match opcode % 8 {
            0 | 1 => {
                let input = make_input(data, &mut cursor, now);
                let target = if opcode % 8 == 0 { &mut flow_a } else { &mut flow_b };
                let before = target.steps().len();
                match dispatcher.advance(input, target) {
                    Ok(advanced) => {
                        assert_eq!(target.steps().len(), before + 1);
                        let _ = advanced.findings;
                    }
                    // A refused step must leave the session untouched.
                    Err(_) => assert_eq!(target.steps().len(), before),
                }
            }
            2 => {
                // Stale timestamp on an otherwise plausible step.
                let mut input = make_input(data, &mut cursor, now);
                input.observed_at = t(0);
                let _ = dispatcher.advance(input, &mut flow_a);
            }
            3 => {
                let _ = dispatcher.evaluate(&flow_a);
                let _ = dispatcher.evaluate(&flow_b);
            }
            4 => {
                let _ = grantcheck_engine::judge(&registry, &flow_a);
            }
            5 => {
                // Repeated param key in the pair list.
                let input = make_input(data, &mut cursor, now)
                    .with_param("state", "dup")
                    .with_param("state", "dup");
                let _ = dispatcher.advance(input, &mut flow_a);
            }
            6 => {
                // Sessions polluted by raw records must still evaluate.
                let mut scratch = flow_a.clone();
                let name = STEP_NAMES[usize::from(byte(data, cursor)) % STEP_NAMES.len()];
                let _ = scratch.record_step(
                    name,
                    direction(byte(data, cursor.saturating_add(1))),
                    scheme(byte(data, cursor.saturating_add(2))),
                    [("error", "junk_code"), ("state", "raw")],
                    t(now.saturating_add(1)),
                );
                cursor = cursor.saturating_add(3);
                let _ = dispatcher.evaluate(&scratch);
            }
            _ => {
                let _ = dispatcher.drain_events();
                // Serialized facts must survive a round trip and re-judge.
                if let Ok(json) = serde_json::to_string(&flow_a) {
                    if let Ok(decoded) = serde_json::from_str::<FlowSession>(&json) {
                        let _ = dispatcher.evaluate(&decoded);
                    }
                }
            }
        }

        now = (now + i64::from(opcode & 0x0f)).min(400_000);
    }
}

fn make_input(data: &[u8], cursor: &mut usize, now: i64) -> StepInput {
    let name = STEP_NAMES[usize::from(byte(data, *cursor)) % STEP_NAMES.len()];
    let dir = direction(byte(data, cursor.saturating_add(1)));
    let sch = scheme(byte(data, cursor.saturating_add(2)));
    let param_count = usize::from(byte(data, cursor.saturating_add(3))) % (MAX_PARAMS + 1);
    *cursor = cursor.saturating_add(4);

    let mut input = StepInput::new(name, dir, sch, t(now));
    for _ in 0..param_count {
        let key = PARAM_KEYS[usize::from(byte(data, *cursor)) % PARAM_KEYS.len()];
        let selector = byte(data, cursor.saturating_add(1));
        *cursor = cursor.saturating_add(2);
        if selector % 3 == 0 {
            input = input.with_param(key, make_value(data, *cursor));
            *cursor = cursor.saturating_add(6);
        } else {
            input = input.with_param(
                key,
                PARAM_VALUES[usize::from(selector) % PARAM_VALUES.len()],
            );
        }
    }
    input
}

fn make_value(data: &[u8], offset: usize) -> String {
    let mut value = String::new();
    for index in 0..6 {
        let raw = byte(data, offset.saturating_add(index));
        value.push(char::from(b'0' + (raw % 75)));
    }
    value
}

fn grant(selector: u8) -> GrantType {
    match selector % 4 {
        0 => GrantType::Implicit,
        1 => GrantType::DeviceCode,
        2 => GrantType::ClientCredentials,
        _ => GrantType::AuthorizationCodePkce,
    }
}

fn direction(selector: u8) -> Direction {
    if selector % 2 == 0 {
        Direction::ClientToServer
    } else {
        Direction::ServerToClient
    }
}

fn scheme(selector: u8) -> TransportScheme {
    if selector % 4 == 0 {
        TransportScheme::Http
    } else {
        TransportScheme::Https
    }
}

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs.clamp(0, 400_000), 0).unwrap()
}

fn byte(data: &[u8], index: usize) -> u8 {
    if data.is_empty() {
        return 0;
    }
    data[index % data.len()]
}
