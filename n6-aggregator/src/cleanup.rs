use std::net::{IpAddr, Ipv4Addr};

use serde_json::Value;

use crate::event::Event;

/// Rewrites published events right before they leave the aggregator.
pub trait PayloadCleanup: Send + Sync {
    /// Modifies the outgoing event in place.
    fn clean(&self, event: &mut Event);
}

/// Fields that older collectors produced in a legacy shape.
const LEGACY_FIELDS: &[&str] = &["dip", "address", "enriched", "name", "id", "category", "source"];

/// Normalizes fields that older collectors produced in a legacy shape.
///
/// String values of the legacy fields are trimmed, `id` and `category` are lowercased and empty
/// strings are removed. Entries of `address` without a valid `ip` are dropped, and so is the
/// whole field once no entry is left. `dip` is removed unless it is a valid IPv4 address, and
/// `enriched` unless it is a pair.
#[derive(Clone, Copy, Debug, Default)]
pub struct LegacyFieldCleanup;

impl PayloadCleanup for LegacyFieldCleanup {
    fn clean(&self, event: &mut Event) {
        for &field in LEGACY_FIELDS {
            let Some(value) = event.get_mut(field) else {
                continue;
            };

            let keep = match field {
                "dip" => clean_dip(value),
                "address" => clean_address(value),
                "enriched" => matches!(value, Value::Array(items) if items.len() == 2),
                "id" | "category" => clean_string(value, true),
                _ => clean_string(value, false),
            };

            if !keep {
                event.remove(field);
            }
        }
    }
}

/// Trims a string in place. Returns `false` if nothing is left of it.
fn clean_string(value: &mut Value, lowercase: bool) -> bool {
    let Value::String(s) = value else {
        return true;
    };

    let trimmed = s.trim();
    *s = if lowercase {
        trimmed.to_lowercase()
    } else {
        trimmed.to_owned()
    };
    !s.is_empty()
}

fn clean_dip(value: &mut Value) -> bool {
    clean_string(value, false)
        && value
            .as_str()
            .is_some_and(|dip| dip.parse::<Ipv4Addr>().is_ok())
}

fn clean_address(value: &mut Value) -> bool {
    let Value::Array(entries) = value else {
        return false;
    };

    entries.retain_mut(|entry| {
        entry
            .get_mut("ip")
            .is_some_and(|ip| clean_string(ip, false) && ip.as_str().is_some_and(is_ip))
    });
    !entries.is_empty()
}

fn is_ip(ip: &str) -> bool {
    ip.parse::<IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::group::tests::event;

    fn clean(value: Value) -> Event {
        let mut payload = event(value);
        LegacyFieldCleanup.clean(&mut payload);
        payload
    }

    #[test]
    fn test_strings_trimmed() {
        let payload = clean(json!({
            "source": " Abuse-CH.FeodoTracker ",
            "category": " CNC",
            "id": "C4CA4238A0B923820DCC509A6F75849B ",
            "name": "\tfeodo ",
            "url": " kept as is ",
        }));

        insta::assert_json_snapshot!(payload, @r###"
        {
          "category": "cnc",
          "id": "c4ca4238a0b923820dcc509a6f75849b",
          "name": "feodo",
          "source": "Abuse-CH.FeodoTracker",
          "url": " kept as is "
        }
        "###);
    }

    #[test]
    fn test_empty_strings_removed() {
        let payload = clean(json!({
            "source": "abuse-ch.feodotracker",
            "name": "  ",
            "id": "",
            "url": "",
            "count": 2,
        }));

        insta::assert_json_snapshot!(payload, @r###"
        {
          "count": 2,
          "source": "abuse-ch.feodotracker",
          "url": ""
        }
        "###);
    }

    #[test]
    fn test_invalid_dip_removed() {
        let valid = clean(json!({"dip": " 10.0.0.1 "}));
        insta::assert_json_snapshot!(valid, @r###"
        {
          "dip": "10.0.0.1"
        }
        "###);

        for dip in [json!("not-an-ip"), json!("::1"), json!("10.0.0.256"), json!(167772161)] {
            assert!(clean(json!({"dip": dip})).is_empty());
        }
    }

    #[test]
    fn test_address_without_ip_dropped() {
        let payload = clean(json!({
            "address": [
                {"ip": "10.0.0.1", "asn": 1234},
                {"asn": 1},
                {"ip": "not-an-ip", "cc": "PL"},
                {"ip": " 10.0.0.2 "},
            ],
        }));

        insta::assert_json_snapshot!(payload, @r###"
        {
          "address": [
            {
              "asn": 1234,
              "ip": "10.0.0.1"
            },
            {
              "ip": "10.0.0.2"
            }
          ]
        }
        "###);
    }

    #[test]
    fn test_address_without_entries_removed() {
        let payload = clean(json!({
            "address": [{"asn": 1}],
            "dip": "not-an-ip",
            "enriched": "x",
        }));
        assert!(payload.is_empty());

        assert!(clean(json!({"address": []})).is_empty());
        assert!(clean(json!({"address": {"ip": "10.0.0.1"}})).is_empty());
    }

    #[test]
    fn test_enriched_must_be_pair() {
        let payload = clean(json!({"enriched": [["fqdn"], {"10.0.0.1": ["asn"]}]}));
        insta::assert_json_snapshot!(payload, @r###"
        {
          "enriched": [
            [
              "fqdn"
            ],
            {
              "10.0.0.1": [
                "asn"
              ]
            }
          ]
        }
        "###);

        for enriched in [json!(["fqdn"]), json!([[], {}, {}]), json!({}), json!("x")] {
            assert!(clean(json!({"enriched": enriched})).is_empty());
        }
    }

    #[test]
    fn test_cleanup_keeps_current_shape() {
        let original = event(json!({
            "source": "abuse-ch.feodotracker",
            "category": "cnc",
            "dip": "192.168.0.1",
            "address": [{"ip": "10.0.0.1", "asn": 1234}],
            "enriched": [["fqdn"], {"10.0.0.1": ["asn"]}],
        }));

        let mut payload = original.clone();
        LegacyFieldCleanup.clean(&mut payload);
        assert_eq!(payload, original);
    }
}
