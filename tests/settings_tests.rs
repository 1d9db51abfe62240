//! Settings validation as seen from client construction, and settings files.

mod common;

use std::path::PathBuf;

use bncs_client::{BncsClient, BncsError, ClientSettings, PingMethod, Product, ValidationErrors};

use common::{collaborators, settings, temp_file, CD_KEY};

fn construction_errors(settings: ClientSettings) -> ValidationErrors {
    match BncsClient::new(settings, collaborators()) {
        Err(BncsError::InvalidSettings(errors)) => errors,
        other => panic!("expected InvalidSettings, got {other:?}"),
    }
}

#[test]
fn valid_settings_build_a_disconnected_client() {
    let client = tokio_test::assert_ok!(BncsClient::new(
        settings(Product::BroodWar),
        collaborators()
    ));
    assert_eq!(client.state(), bncs_client::SessionState::Disconnected);
    assert_eq!(client.unique_username(), None);
}

#[test]
fn every_violation_is_reported_together() {
    let mut broken = settings(Product::Diablo2);
    broken.username = "   ".to_string();
    broken.ping_method = "carrier-pigeon".to_string();
    broken.game_exe = PathBuf::from("/nonexistent/game.exe");

    let errors = construction_errors(broken);
    assert_eq!(
        errors,
        ValidationErrors::USERNAME_EMPTY
            | ValidationErrors::INVALID_PING_METHOD
            | ValidationErrors::GAME_EXE_MISSING
    );
    let rendered = BncsError::InvalidSettings(errors).to_string();
    assert!(rendered.contains("USERNAME_EMPTY"), "{rendered}");
    assert!(rendered.contains("INVALID_PING_METHOD"), "{rendered}");
    assert!(rendered.contains("GAME_EXE_MISSING"), "{rendered}");
}

#[test]
fn keys_are_checked_per_product() {
    let no_key = settings(Product::Warcraft3).with_cd_key("");
    assert_eq!(construction_errors(no_key), ValidationErrors::CD_KEY_MISSING);

    let bad_key = settings(Product::Warcraft3).with_cd_key("NOTAKEY");
    assert_eq!(construction_errors(bad_key), ValidationErrors::CD_KEY_INVALID);

    let no_expansion = settings(Product::FrozenThrone).with_expansion_cd_key("");
    assert_eq!(
        construction_errors(no_expansion),
        ValidationErrors::EXPANSION_KEY_MISSING
    );

    // Separators and spacing are stripped before the decoder sees the key.
    let dashed = settings(Product::Warcraft3).with_cd_key(" aaaa-bbbb-cccc-dddd ");
    let client = tokio_test::assert_ok!(BncsClient::new(dashed, collaborators()));
    assert_eq!(client.settings().cd_key, CD_KEY);
}

#[test]
fn lockdown_products_need_an_image() {
    let mut starcraft = settings(Product::Starcraft);
    starcraft.lockdown_image = None;
    assert_eq!(
        construction_errors(starcraft),
        ValidationErrors::LOCKDOWN_IMAGE_MISSING
    );
}

#[test]
fn unsupported_products_are_refused() {
    let mut diablo = settings(Product::Diablo2);
    diablo.product = "DRTL".to_string();
    assert!(construction_errors(diablo).contains(ValidationErrors::PRODUCT_NOT_CONNECTABLE));

    let mut unknown = settings(Product::Diablo2);
    unknown.product = "XXXX".to_string();
    assert!(construction_errors(unknown).contains(ValidationErrors::UNKNOWN_PRODUCT));
}

#[test]
fn settings_load_from_json() {
    let exe = temp_file("json-exe");
    let file2 = temp_file("json-file2");
    let file3 = temp_file("json-file3");
    let json = serde_json::json!({
        "username": "Sylvanas",
        "password": "banshee",
        "product": "D2XP",
        "cd_key": "AAAABBBBCCCCDDDD",
        "expansion_cd_key": "EEEEFFFFGGGGHHHH",
        "gateway": { "host": "uswest.example.net", "port": 6200 },
        "ping_method": "no_reply",
        "game_exe": exe,
        "game_file2": file2,
        "game_file3": file3,
        "home_channel": "Undercity"
    })
    .to_string();

    let settings = tokio_test::assert_ok!(ClientSettings::from_json(&json));
    assert_eq!(settings.product(), Some(Product::LordOfDestruction));
    assert_eq!(settings.ping_method(), Some(PingMethod::NoReply));
    assert_eq!(settings.gateway.to_string(), "uswest.example.net:6200");
    assert!(settings.auto_login, "missing fields take their defaults");

    let client = tokio_test::assert_ok!(BncsClient::new(settings, collaborators()));
    assert_eq!(client.settings().home_channel, "Undercity");
}

#[test]
fn malformed_json_is_a_config_error() {
    let err = tokio_test::assert_err!(ClientSettings::from_json("{ \"username\": 7 }"));
    assert!(matches!(err, BncsError::Config(_)));
}
