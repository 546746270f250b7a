//! 流式操作的临时结果主题

use rand::Rng;

const TOKEN_DIGITS: u32 = 8;
const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// 生成 `topic_<serviceType>_<token>` 形式的主题名，token 为最多 8 位的 36 进制随机数
pub fn ephemeral_topic_name(service_type: &str) -> String {
    let value = rand::thread_rng().gen_range(0..36u64.pow(TOKEN_DIGITS));
    format!("topic_{}_{}", service_type, to_base36(value))
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(TOKEN_DIGITS as usize);
    while value > 0 {
        digits.push(ALPHABET[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_encoding() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(36u64.pow(8) - 1), "zzzzzzzz");
    }

    #[test]
    fn topic_name_format() {
        for _ in 0..100 {
            let name = ephemeral_topic_name("blotter");
            let token = name.strip_prefix("topic_blotter_").unwrap();
            assert!(!token.is_empty() && token.len() <= 8, "bad token in {name}");
            assert!(token.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        }
    }
}
