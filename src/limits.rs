// Hard caps on request and row sizes.

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_USERNAME_LEN: usize = 64;
pub const MAX_SUBJECT_LEN: usize = 512;
/// bcrypt only reads the first 72 bytes of the secret.
pub const MAX_SECRET_LEN: usize = 72;
pub const MAX_SLOTS_PER_PROVIDER: usize = 10_000;
pub const MAX_RESERVATIONS_PER_CONSUMER: usize = 10_000;
pub const MAX_SQL_LEN: usize = 16 * 1024;
pub const MAX_CONNECTIONS: usize = 256;
/// Work factor bounds bcrypt accepts.
pub const MIN_BCRYPT_COST: u32 = 4;
pub const MAX_BCRYPT_COST: u32 = 31;
