// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Network byte-order accessors for the replication wire protocols.
//! Every multi-byte integer on the wire is big-endian.

macro_rules! generate_read_fn {
    ($fn_name: ident, $data_type: ty, $type_size: expr) => {
        /// Reads a value of the corresponding width from the start of `input`.
        ///
        /// # Panics
        /// Panics when `input` is shorter than the value.
        pub fn $fn_name(input: &[u8]) -> $data_type {
            assert!($type_size == std::mem::size_of::<$data_type>());
            let mut array = [0u8; $type_size];
            array.copy_from_slice(&input[..$type_size]);
            <$data_type>::from_be_bytes(array)
        }
    };
}

macro_rules! generate_write_fn {
    ($fn_name: ident, $data_type: ty) => {
        /// Writes `n` at the start of `buf`.
        ///
        /// # Panics
        /// Panics when `buf` is shorter than the value.
        pub fn $fn_name(buf: &mut [u8], n: $data_type) {
            let bytes = <$data_type>::to_be_bytes(n);
            buf[..bytes.len()].copy_from_slice(&bytes);
        }
    };
}

generate_read_fn!(read_be_u16, u16, 2);
generate_read_fn!(read_be_u32, u32, 4);
generate_read_fn!(read_be_u64, u64, 8);

generate_write_fn!(write_be_u16, u16);
generate_write_fn!(write_be_u32, u32);
generate_write_fn!(write_be_u64, u64);

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! byte_order_test_read_write {
        ($test_name: ident, $write_fn_name: ident, $read_fn_name: ident, $data_type: ty) => {
            #[test]
            fn $test_name() {
                let test_cases = [
                    (
                        0x0123_4567_89AB_CDEF_u64,
                        [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef],
                    ),
                    (
                        0x0000_0000_0000_0000_u64,
                        [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
                    ),
                    (
                        0x1923_2345_ABF3_CCD4_u64,
                        [0x19, 0x23, 0x23, 0x45, 0xAB, 0xF3, 0xCC, 0xD4],
                    ),
                    (
                        0xFFFF_FFFF_FFFF_FFFF_u64,
                        [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
                    ),
                ];

                let type_size = std::mem::size_of::<$data_type>();
                for (value, bytes) in &test_cases {
                    let value = *value as $data_type;
                    let mut buf = vec![0u8; type_size];
                    $write_fn_name(&mut buf, value);
                    assert_eq!(buf, &bytes[8 - type_size..]);
                    assert_eq!($read_fn_name(&buf), value);
                }
            }
        };
    }

    byte_order_test_read_write!(test_be_u16, write_be_u16, read_be_u16, u16);
    byte_order_test_read_write!(test_be_u32, write_be_u32, read_be_u32, u32);
    byte_order_test_read_write!(test_be_u64, write_be_u64, read_be_u64, u64);

    #[test]
    fn test_read_ignores_trailing_bytes() {
        let buf = [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11];
        assert_eq!(read_be_u32(&buf), 0xDEAD_BEEF);
        assert_eq!(read_be_u16(&buf), 0xDEAD);
    }
}
