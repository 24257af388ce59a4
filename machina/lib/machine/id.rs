use rand::Rng;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The length of a machine identifier in hex characters.
pub const MACHINE_ID_LENGTH: usize = 14;

/// The alphabet machine identifiers are drawn from.
const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Generates a short opaque machine identifier.
///
/// The randomness is not cryptographic and the space is small; the manager
/// guards against collisions with check-and-retry against its live table, so
/// an id is never reused within the process lifetime.
pub fn generate_machine_id() -> String {
    let mut rng = rand::thread_rng();
    (0..MACHINE_ID_LENGTH)
        .map(|_| HEX_CHARS[rng.gen_range(0..HEX_CHARS.len())] as char)
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_generated_ids_are_well_formed() {
        for _ in 0..64 {
            let id = generate_machine_id();
            assert_eq!(id.len(), MACHINE_ID_LENGTH);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn test_generated_ids_do_not_collide_in_practice() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_machine_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
