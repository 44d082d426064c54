use rand::{distributions::Alphanumeric, Rng};

/// Random alphanumeric string, used as request id on the lock service wire protocol
pub fn generate_random_ascii_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::generate_random_ascii_string;

    #[test]
    fn generates_ascii_of_requested_len() {
        let s = generate_random_ascii_string(16);
        assert_eq!(s.len(), 16);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
