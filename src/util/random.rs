use rand::RngCore;
#[cfg(test)] use std::sync::Mutex;



#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn next_u32() -> u32;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u32() -> u32 {
        rand::thread_rng().next_u32()
    }
}

/// Seed for a new peer's id counter. Zero is reserved for 'no id' on the wire, so it is never
///  returned.
pub fn initial_peer_id<R: Random>() -> u32 {
    match R::next_u32() {
        0 => 1,
        n => n,
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::zero(0, 1)]
    #[case::one(1, 1)]
    #[case::arbitrary(0x1234_5678, 0x1234_5678)]
    #[case::max(u32::MAX, u32::MAX)]
    fn test_initial_peer_id(#[case] raw: u32, #[case] expected: u32) {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let ctx = MockRandom::next_u32_context();
        ctx.expect().return_const(raw);

        assert_eq!(initial_peer_id::<MockRandom>(), expected);
    }
}
