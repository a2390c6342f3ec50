use rand::Rng;

/// Generate a numeric passcode of `length` digits for shared-secret invitations
pub fn generate_passcode(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_passcode_shape() {
        let code = generate_passcode(6);
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        assert!(generate_passcode(0).is_empty());
    }
}
