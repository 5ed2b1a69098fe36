use strum::{EnumCount, EnumIter, FromRepr};

/// CryptoAPI algorithm identifiers (`ALG_ID`).
///
/// `CALG_SHA` shares its value with [`AlgId::CALG_SHA1`] and is reported under that name.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, EnumIter, EnumCount, FromRepr,
)]
#[repr(u32)]
#[allow(non_camel_case_types, missing_docs)]
pub enum AlgId {
    CALG_3DES = 0x0000_6603,
    CALG_3DES_112 = 0x0000_6609,
    CALG_AES = 0x0000_6611,
    CALG_AES_128 = 0x0000_660e,
    CALG_AES_192 = 0x0000_660f,
    CALG_AES_256 = 0x0000_6610,
    CALG_AGREEDKEY_ANY = 0x0000_aa03,
    CALG_CYLINK_MEK = 0x0000_660c,
    CALG_DES = 0x0000_6601,
    CALG_DESX = 0x0000_6604,
    CALG_DH_EPHEM = 0x0000_aa02,
    CALG_DH_SF = 0x0000_aa01,
    CALG_DSS_SIGN = 0x0000_2200,
    CALG_ECDH = 0x0000_aa05,
    CALG_ECDH_EPHEM = 0x0000_ae06,
    CALG_ECDSA = 0x0000_2203,
    CALG_ECMQV = 0x0000_a001,
    CALG_HASH_REPLACE_OWF = 0x0000_800b,
    CALG_HUGHES_MD5 = 0x0000_a003,
    CALG_HMAC = 0x0000_8009,
    CALG_KEA_KEYX = 0x0000_aa04,
    CALG_MAC = 0x0000_8005,
    CALG_MD2 = 0x0000_8001,
    CALG_MD4 = 0x0000_8002,
    CALG_MD5 = 0x0000_8003,
    CALG_NO_SIGN = 0x0000_2000,
    CALG_OID_INFO_CNG_ONLY = 0xffff_ffff,
    CALG_OID_INFO_PARAMETERS = 0xffff_fffe,
    CALG_PCT1_MASTER = 0x0000_4c04,
    CALG_RC2 = 0x0000_6602,
    CALG_RC4 = 0x0000_6801,
    CALG_RC5 = 0x0000_660d,
    CALG_RSA_KEYX = 0x0000_a400,
    CALG_RSA_SIGN = 0x0000_2400,
    CALG_SCHANNEL_ENC_KEY = 0x0000_4c07,
    CALG_SCHANNEL_MAC_KEY = 0x0000_4c03,
    CALG_SCHANNEL_MASTER_HASH = 0x0000_4c02,
    CALG_SEAL = 0x0000_6802,
    CALG_SHA1 = 0x0000_8004,
    CALG_SHA_256 = 0x0000_800c,
    CALG_SHA_384 = 0x0000_800d,
    CALG_SHA_512 = 0x0000_800e,
    CALG_SKIPJACK = 0x0000_660a,
    CALG_SSL2_MASTER = 0x0000_4c05,
    CALG_SSL3_MASTER = 0x0000_4c01,
    CALG_SSL3_SHAMD5 = 0x0000_8008,
    CALG_TEK = 0x0000_660b,
    CALG_TLS1_MASTER = 0x0000_4c06,
    CALG_TLS1PRF = 0x0000_800a,
}

impl AlgId {
    /// The algorithm class (`GET_ALG_CLASS`), bits 13..16 of the identifier.
    #[must_use]
    pub fn class(self) -> u32 {
        (self as u32) & (7 << 13)
    }

    /// Returns `true` for hash algorithms (`ALG_CLASS_HASH`).
    #[must_use]
    pub fn is_hash(self) -> bool {
        self.class() == 4 << 13
    }
}

/// Key BLOB types (`bType` of `BLOBHEADER`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, EnumIter, EnumCount, FromRepr,
)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum BlobType {
    /// Session key encrypted with the recipient's key exchange key
    SIMPLEBLOB = 0x1,
    /// RSA or DSS public key
    PUBLICKEYBLOB = 0x6,
    /// Public/private key pair
    PRIVATEKEYBLOB = 0x7,
    /// Session key in plaintext
    PLAINTEXTKEYBLOB = 0x8,
    /// Key in a CSP-specific format
    OPAQUEKEYBLOB = 0x9,
    /// Public key with extended parameters
    PUBLICKEYBLOBEX = 0xA,
    /// Symmetric key wrapped with another symmetric key
    SYMMETRICWRAPKEYBLOB = 0xB,
    /// Key state
    KEYSTATEBLOB = 0xC,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn algorithm_lookup() {
        assert_eq!(AlgId::from_repr(0x6610), Some(AlgId::CALG_AES_256));
        assert_eq!(AlgId::from_repr(0x8004), Some(AlgId::CALG_SHA1));
        assert_eq!(AlgId::from_repr(0x1234), None);
        assert_eq!(AlgId::CALG_RC4.to_string(), "CALG_RC4");

        let names: HashSet<String> = AlgId::iter().map(|a| a.to_string()).collect();
        assert_eq!(names.len(), AlgId::COUNT);
    }

    #[test]
    fn algorithm_classes() {
        assert!(AlgId::CALG_SHA_256.is_hash());
        assert!(AlgId::CALG_MD5.is_hash());
        assert!(!AlgId::CALG_AES_128.is_hash());
        assert_eq!(AlgId::CALG_RSA_KEYX.class(), 5 << 13);
    }
}
