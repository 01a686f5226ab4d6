use anyhow::anyhow;
use bytes::Buf;


macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow reading {}: {} bytes remaining", stringify!($ty), self.remaining()));
            }
            Ok(self.$getter())
        }
    }
}

/// Checked network byte order reads for the matching wire format. The plain `Buf` getters panic
///  on underflow, which must never happen for datagrams received from the network.
pub trait BufExt: Buf {
    get_try_impl!(try_get_u8_checked, u8, get_u8);
    get_try_impl!(try_get_u16_be, u16, get_u16);
    get_try_impl!(try_get_u32_be, u32, get_u32);
}

impl<T: Buf> BufExt for T {}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_checked_reads() {
        let mut buf: &[u8] = &[1, 0, 2, 0, 0, 0, 3, 9, 8];
        assert_eq!(buf.try_get_u8_checked().unwrap(), 1);
        assert_eq!(buf.try_get_u16_be().unwrap(), 2);
        assert_eq!(buf.try_get_u32_be().unwrap(), 3);
        assert_eq!(buf.try_get_u16_be().unwrap(), 0x0908);
        assert!(buf.try_get_u8_checked().is_err());
    }

    #[test]
    fn test_underflow_leaves_buffer_untouched() {
        let mut buf: &[u8] = &[1, 2, 3];
        assert!(buf.try_get_u32_be().is_err());
        assert_eq!(buf.remaining(), 3);
        assert_eq!(buf.try_get_u16_be().unwrap(), 0x0102);
        assert!(buf.try_get_u16_be().is_err());
        assert_eq!(buf.remaining(), 1);
    }
}
