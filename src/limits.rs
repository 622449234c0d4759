use crate::model::Ms;

// ── Sites ────────────────────────────────────────────────────────

pub const MAX_SITES: usize = 64;
pub const MAX_SITE_NAME_LEN: usize = 128;

// ── Text fields ──────────────────────────────────────────────────

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_DESCRIPTION_LEN: usize = 4_000;
pub const MAX_COMMENT_LEN: usize = 2_000;
pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 72; // bcrypt truncates beyond this

// ── Catalog ──────────────────────────────────────────────────────

pub const MAX_ROOM_PRICE: u64 = 1_000_000_000_000;
pub const MAX_DATES_PER_ROOM: usize = 3_660;
pub const MAX_BATCH_SIZE: usize = 366;
/// Markup bounds in basis points: -50% ..= +500%.
pub const MIN_MARKUP_BP: i32 = -5_000;
pub const MAX_MARKUP_BP: i32 = 50_000;

// ── Images ───────────────────────────────────────────────────────

pub const MAX_IMAGE_BYTES: usize = 1024 * 1024;
pub const MAX_IMAGES: usize = 100_000;

// ── Orders ───────────────────────────────────────────────────────

pub const MAX_STAY_NIGHTS: usize = 60;
pub const DEFAULT_PAYMENT_WINDOW_MS: Ms = 2 * 3_600_000;

// ── Accounts ─────────────────────────────────────────────────────

pub const SESSION_TTL_MS: Ms = 24 * 3_600_000;
pub const OTP_TTL_MS: Ms = 24 * 3_600_000;
pub const OTP_DAILY_ATTEMPTS: u8 = 5;
/// Wrong guesses allowed against one issued OTP.
pub const OTP_MAX_GUESSES: u32 = 5;
pub const RESET_TOKEN_TTL_MS: Ms = 3_600_000;

// ── Listings ─────────────────────────────────────────────────────

pub const PAGE_SIZE: usize = 5;
pub const MAX_PAGE: usize = 100_000;
