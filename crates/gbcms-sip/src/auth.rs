// GB28181 Digest 鉴权
// REGISTER 挑战/校验，以及级联注册时应答上级的 401/407

use std::collections::HashMap;

/// 解析 Digest Authorization / WWW-Authenticate 头部为键值对
pub fn parse_digest_header(value: &str) -> Option<HashMap<String, String>> {
    let rest = value.strip_prefix("Digest ").unwrap_or(value);

    let mut map = HashMap::new();
    for part in rest.split(',') {
        let trimmed = part.trim();
        if let Some(eq_idx) = trimmed.find('=') {
            let key = trimmed[..eq_idx].trim().to_string();
            let mut val = trimmed[eq_idx + 1..].trim().to_string();
            if val.starts_with('"') && val.ends_with('"') && val.len() >= 2 {
                val = val[1..val.len() - 1].to_string();
            }
            map.insert(key, val);
        }
    }

    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// 计算 HTTP Digest 响应（不使用 qop）
pub fn compute_digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));
    format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)))
}

/// 生成 401 挑战的 WWW-Authenticate 头部值，返回 (nonce, 头部值)
pub fn make_challenge(realm: &str, seed: &str) -> (String, String) {
    let nonce_source = format!("{}:{}", seed, chrono::Utc::now().timestamp_millis());
    let nonce = format!("{:x}", md5::compute(nonce_source));
    let value = format!(
        "Digest realm=\"{}\", nonce=\"{}\", algorithm=\"MD5\"",
        realm, nonce
    );
    (nonce, value)
}

/// 根据上级挑战构造 Authorization 头部值
pub fn make_authorization(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &HashMap<String, String>,
) -> Option<String> {
    let realm = challenge.get("realm")?;
    let nonce = challenge.get("nonce")?;
    let response = compute_digest_response(username, realm, password, method, uri, nonce);
    Some(format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
        username, realm, nonce, uri, response
    ))
}

/// 校验 Authorization 头部。username 必须等于 device_id。
pub fn verify_authorization(
    header: &str,
    device_id: &str,
    default_realm: &str,
    default_uri: &str,
    password: &str,
    method: &str,
) -> bool {
    let Some(params) = parse_digest_header(header) else {
        return false;
    };
    let username = params.get("username").map(String::as_str).unwrap_or(device_id);
    if username != device_id {
        return false;
    }
    let realm = params.get("realm").map(String::as_str).unwrap_or(default_realm);
    let uri = params.get("uri").map(String::as_str).unwrap_or(default_uri);
    let (Some(nonce), Some(response)) = (params.get("nonce"), params.get("response")) else {
        return false;
    };

    compute_digest_response(username, realm, password, method, uri, nonce) == *response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_digest_header() {
        let header = r#"Digest username="34020000001320000001", realm="3402000000", nonce="abc123", uri="sip:34020000002000000001@3402000000", response="deadbeef""#;
        let params = parse_digest_header(header).unwrap();
        assert_eq!(params.get("username").unwrap(), "34020000001320000001");
        assert_eq!(params.get("nonce").unwrap(), "abc123");
    }

    #[test]
    fn test_digest_roundtrip() {
        let (nonce, challenge) = make_challenge("3402000000", "seed");
        assert!(challenge.contains("Digest realm=\"3402000000\""));

        let uri = "sip:34020000002000000001@3402000000";
        let response = compute_digest_response(
            "34020000001320000001",
            "3402000000",
            "12345678",
            "REGISTER",
            uri,
            &nonce,
        );
        let header = format!(
            r#"Digest username="34020000001320000001", realm="3402000000", nonce="{}", uri="{}", response="{}""#,
            nonce, uri, response
        );

        assert!(verify_authorization(
            &header,
            "34020000001320000001",
            "3402000000",
            uri,
            "12345678",
            "REGISTER"
        ));
        assert!(!verify_authorization(
            &header,
            "34020000001320000001",
            "3402000000",
            uri,
            "wrongpass",
            "REGISTER"
        ));
    }

    #[test]
    fn test_make_authorization_against_challenge() {
        let (_, challenge_header) = make_challenge("3402000000", "x");
        let challenge = parse_digest_header(&challenge_header).unwrap();
        let auth = make_authorization(
            "34020000002000000001",
            "secret",
            "REGISTER",
            "sip:sup@dom",
            &challenge,
        )
        .unwrap();
        assert!(verify_authorization(
            &auth,
            "34020000002000000001",
            "3402000000",
            "sip:sup@dom",
            "secret",
            "REGISTER"
        ));
    }

    #[test]
    fn test_username_mismatch_rejected() {
        let (nonce, _) = make_challenge("r", "s");
        let response =
            compute_digest_response("other", "r", "pw", "REGISTER", "sip:u@d", &nonce);
        let header = format!(
            r#"Digest username="other", realm="r", nonce="{}", uri="sip:u@d", response="{}""#,
            nonce, response
        );
        assert!(!verify_authorization(&header, "expected", "r", "sip:u@d", "pw", "REGISTER"));
    }
}
