use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::mailer;
use crate::model::*;
use crate::validate;

use super::{day_of, invalid, now_ms, require_user, Engine, EngineError};

fn new_otp() -> String {
    format!("{:04}", rand::thread_rng().gen_range(0..10_000))
}

fn new_reset_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

impl Engine {
    async fn hash_password(&self, password: &str) -> Result<String, EngineError> {
        let password = password.to_string();
        let cost = self.config.bcrypt_cost;
        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| EngineError::Crypto(e.to_string()))?
            .map_err(|e| EngineError::Crypto(e.to_string()))
    }

    async fn password_matches(&self, password: &str, hash: &str) -> Result<bool, EngineError> {
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| EngineError::Crypto(e.to_string()))?
            .map_err(|e| EngineError::Crypto(e.to_string()))
    }

    fn password_hash_of(&self, role: Role, account_id: Ulid) -> Option<String> {
        match role {
            Role::Tenant => self.store.tenants.get(&account_id).map(|t| t.password_hash.clone()),
            Role::User => self.store.users.get(&account_id).map(|u| u.password_hash.clone()),
        }
    }

    /// Fails when a referenced image was never uploaded.
    pub(super) fn check_image(&self, image_id: Option<Ulid>) -> Result<(), EngineError> {
        match image_id {
            Some(id) if !self.store.images.contains_key(&id) => Err(EngineError::NotFound("image", id)),
            _ => Ok(()),
        }
    }

    // ── Signup ───────────────────────────────────────────────

    pub async fn register_tenant(
        &self,
        id: Ulid,
        name: &str,
        email: &str,
        password: &str,
        phone_number: &str,
        ktp_card: Option<Ulid>,
    ) -> Result<(), EngineError> {
        validate::non_empty("name", name, MAX_NAME_LEN).map_err(invalid)?;
        validate::email(email).map_err(invalid)?;
        validate::strong_password(password).map_err(invalid)?;
        validate::phone_number(phone_number).map_err(invalid)?;
        let password_hash = self.hash_password(password).await?;

        let _catalog = self.catalog_lock.lock().await;
        if self.store.tenants.contains_key(&id) {
            return Err(EngineError::AlreadyExists("tenant", id));
        }
        if self.store.account_by_email(Role::Tenant, email).is_some() {
            return Err(EngineError::EmailTaken(email.to_string()));
        }
        self.check_image(ktp_card)?;

        let event = Event::TenantRegistered {
            id,
            name: name.trim().to_string(),
            email: email.trim().to_string(),
            password_hash,
            phone_number: phone_number.to_string(),
            ktp_card,
            at: now_ms(),
        };
        self.persist(&event).await?;
        info!("tenant registered: {id}");
        Ok(())
    }

    /// Create an unverified renter and mail the first OTP.
    pub async fn register_user(
        &self,
        id: Ulid,
        name: &str,
        email: &str,
        password: &str,
        phone_number: &str,
    ) -> Result<(), EngineError> {
        validate::non_empty("name", name, MAX_NAME_LEN).map_err(invalid)?;
        validate::email(email).map_err(invalid)?;
        validate::strong_password(password).map_err(invalid)?;
        validate::phone_number(phone_number).map_err(invalid)?;
        let password_hash = self.hash_password(password).await?;

        let otp = new_otp();
        {
            let _catalog = self.catalog_lock.lock().await;
            if self.store.users.contains_key(&id) {
                return Err(EngineError::AlreadyExists("user", id));
            }
            if self.store.account_by_email(Role::User, email).is_some() {
                return Err(EngineError::EmailTaken(email.to_string()));
            }
            let now = now_ms();
            self.persist(&Event::UserRegistered {
                id,
                name: name.trim().to_string(),
                email: email.trim().to_string(),
                password_hash,
                phone_number: phone_number.to_string(),
                at: now,
            })
            .await?;
            self.persist(&Event::OtpIssued {
                user_id: id,
                otp: otp.clone(),
                attempts_left: OTP_DAILY_ATTEMPTS,
                at: now,
            })
            .await?;
        }
        info!("user registered: {id}");
        self.deliver(mailer::otp_mail(email.trim(), &otp)).await;
        Ok(())
    }

    // ── Sessions ─────────────────────────────────────────────

    pub async fn login(&self, role: Role, email: &str, password: &str) -> Result<LoginInfo, EngineError> {
        let account_id = self
            .store
            .account_by_email(role, email)
            .ok_or(EngineError::InvalidCredentials)?;
        let hash = self
            .password_hash_of(role, account_id)
            .ok_or(EngineError::InvalidCredentials)?;
        if !self.password_matches(password, &hash).await? {
            return Err(EngineError::InvalidCredentials);
        }

        let session = Session {
            token: Ulid::new(),
            role,
            account_id,
            expires_at: now_ms() + SESSION_TTL_MS,
        };
        self.sessions.insert(session.token, session);
        Ok(LoginInfo {
            token: session.token,
            role,
            account_id,
            email: email.trim().to_string(),
            expires_at: session.expires_at,
        })
    }

    /// Resolve a session token. Expired sessions are dropped on sight.
    pub fn session(&self, token: Ulid) -> Result<Session, EngineError> {
        let session = self
            .sessions
            .get(&token)
            .map(|s| *s.value())
            .ok_or(EngineError::Unauthenticated)?;
        if session.expires_at <= now_ms() {
            self.sessions.remove(&token);
            return Err(EngineError::Unauthenticated);
        }
        Ok(session)
    }

    pub fn logout(&self, token: Ulid) {
        self.sessions.remove(&token);
    }

    /// Drop expired sessions. Returns how many were removed.
    pub fn sweep_sessions(&self, now: Ms) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at > now);
        before - self.sessions.len()
    }

    // ── Verification ─────────────────────────────────────────

    pub async fn verify_user(&self, user_id: Ulid, otp: &str) -> Result<(), EngineError> {
        self.verify_user_at(user_id, otp, now_ms()).await
    }

    pub async fn verify_user_at(&self, user_id: Ulid, otp: &str, now: Ms) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let verified = self
            .store
            .users
            .get(&user_id)
            .map(|u| u.verified)
            .ok_or(EngineError::NotFound("user", user_id))?;
        if verified {
            return Err(EngineError::AlreadyVerified);
        }
        let (expected, issued_at) = self
            .store
            .verifications
            .get(&user_id)
            .map(|v| (v.otp.clone(), v.issued_at))
            .ok_or(EngineError::OtpExpired)?;
        if now - issued_at > OTP_TTL_MS {
            return Err(EngineError::OtpExpired);
        }
        if self.otp_misses.get(&user_id).is_some_and(|m| *m >= OTP_MAX_GUESSES) {
            return Err(EngineError::LimitExceeded("too many wrong codes, request a new one"));
        }
        if otp.trim() != expected {
            *self.otp_misses.entry(user_id).or_insert(0) += 1;
            return Err(EngineError::OtpMismatch);
        }
        self.persist(&Event::UserVerified { user_id }).await?;
        self.otp_misses.remove(&user_id);
        info!("user verified: {user_id}");
        Ok(())
    }

    pub async fn resend_otp(&self, user_id: Ulid) -> Result<(), EngineError> {
        self.resend_otp_at(user_id, now_ms()).await
    }

    /// Issue a fresh OTP. Attempts refill when the last issue was on an
    /// earlier UTC day.
    pub async fn resend_otp_at(&self, user_id: Ulid, now: Ms) -> Result<(), EngineError> {
        let otp = new_otp();
        let email = {
            let _catalog = self.catalog_lock.lock().await;
            let (verified, email) = self
                .store
                .users
                .get(&user_id)
                .map(|u| (u.verified, u.email.clone()))
                .ok_or(EngineError::NotFound("user", user_id))?;
            if verified {
                return Err(EngineError::AlreadyVerified);
            }
            let attempts = self
                .store
                .verifications
                .get(&user_id)
                .map(|v| {
                    if day_of(v.issued_at) < day_of(now) {
                        OTP_DAILY_ATTEMPTS
                    } else {
                        v.attempts_left
                    }
                })
                .unwrap_or(OTP_DAILY_ATTEMPTS);
            if attempts == 0 {
                return Err(EngineError::OtpAttemptsExhausted);
            }
            self.persist(&Event::OtpIssued {
                user_id,
                otp: otp.clone(),
                attempts_left: attempts - 1,
                at: now,
            })
            .await?;
            self.otp_misses.remove(&user_id);
            email
        };
        self.deliver(mailer::otp_mail(&email, &otp)).await;
        Ok(())
    }

    // ── Passwords ────────────────────────────────────────────

    /// Mail a reset token. Unknown emails succeed without doing anything.
    pub async fn request_password_reset(&self, email: &str) -> Result<(), EngineError> {
        let Some(user_id) = self.store.account_by_email(Role::User, email) else {
            return Ok(());
        };
        let token = new_reset_token();
        let address = {
            let _catalog = self.catalog_lock.lock().await;
            let address = self
                .store
                .users
                .get(&user_id)
                .map(|u| u.email.clone())
                .ok_or(EngineError::NotFound("user", user_id))?;
            self.persist(&Event::ResetIssued {
                user_id,
                token: token.clone(),
                at: now_ms(),
            })
            .await?;
            address
        };
        self.deliver(mailer::reset_mail(&address, &token)).await;
        Ok(())
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), EngineError> {
        self.reset_password_at(token, new_password, now_ms()).await
    }

    pub async fn reset_password_at(
        &self,
        token: &str,
        new_password: &str,
        now: Ms,
    ) -> Result<(), EngineError> {
        validate::strong_password(new_password).map_err(invalid)?;
        let password_hash = self.hash_password(new_password).await?;

        let _catalog = self.catalog_lock.lock().await;
        let (user_id, issued_at) = self
            .store
            .resets
            .get(token)
            .map(|r| (r.user_id, r.issued_at))
            .ok_or(EngineError::ResetTokenInvalid)?;
        if now - issued_at > RESET_TOKEN_TTL_MS {
            return Err(EngineError::ResetTokenInvalid);
        }
        self.persist(&Event::ResetCompleted {
            token: token.to_string(),
            user_id,
            password_hash,
        })
        .await
    }

    pub async fn change_password(
        &self,
        session: &Session,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), EngineError> {
        validate::strong_password(new_password).map_err(invalid)?;
        let current = self
            .password_hash_of(session.role, session.account_id)
            .ok_or(EngineError::Unauthenticated)?;
        if !self.password_matches(old_password, &current).await? {
            return Err(EngineError::InvalidCredentials);
        }
        let password_hash = self.hash_password(new_password).await?;

        let _catalog = self.catalog_lock.lock().await;
        self.persist(&Event::PasswordChanged {
            role: session.role,
            account_id: session.account_id,
            password_hash,
        })
        .await
    }

    // ── Profile ──────────────────────────────────────────────

    pub async fn update_profile(
        &self,
        session: &Session,
        user_id: Ulid,
        update: ProfileUpdate,
    ) -> Result<ProfileInfo, EngineError> {
        if require_user(session)? != user_id {
            return Err(EngineError::Forbidden("cannot edit another user's profile"));
        }
        if let Some(name) = &update.name {
            validate::non_empty("name", name, MAX_NAME_LEN).map_err(invalid)?;
        }
        if let Some(phone) = &update.phone_number {
            validate::phone_number(phone).map_err(invalid)?;
        }
        if let Some(gender) = &update.gender {
            validate::non_empty("gender", gender, MAX_NAME_LEN).map_err(invalid)?;
        }
        if let Some(birth_date) = update.birth_date
            && birth_date > day_of(now_ms())
        {
            return Err(EngineError::Invalid("birth date is in the future".into()));
        }
        self.check_image(update.profile_picture)?;

        let _catalog = self.catalog_lock.lock().await;
        let current = self
            .store
            .users
            .get(&user_id)
            .map(|u| u.clone())
            .ok_or(EngineError::NotFound("user", user_id))?;
        self.persist(&Event::ProfileUpdated {
            user_id,
            name: update.name.map(|n| n.trim().to_string()).unwrap_or(current.name),
            phone_number: update.phone_number.unwrap_or(current.phone_number),
            gender: update.gender.or(current.gender),
            birth_date: update.birth_date.or(current.birth_date),
            profile_picture: update.profile_picture.or(current.profile_picture),
        })
        .await?;
        self.profile(user_id)
    }

    pub fn profile(&self, user_id: Ulid) -> Result<ProfileInfo, EngineError> {
        self.store
            .users
            .get(&user_id)
            .map(|u| ProfileInfo {
                id: u.id,
                name: u.name.clone(),
                email: u.email.clone(),
                phone_number: u.phone_number.clone(),
                gender: u.gender.clone(),
                birth_date: u.birth_date,
                profile_picture: u.profile_picture,
                verified: u.verified,
            })
            .ok_or(EngineError::NotFound("user", user_id))
    }
}
