use std::collections::HashSet;

use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{find_batch_conflict, find_conflict, now_ms, validate_span};
use super::queries::select_rows;
use super::{BookingBook, Engine, EngineError, WalCommand};

// ── Field validation ─────────────────────────────────────────────

fn validate_name(field: &'static str, name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Invalid(field));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(name.to_string())
}

/// Lowercases and trims. Requires a local part and a domain around one `@`.
fn validate_email(email: &str) -> Result<String, EngineError> {
    let email = email.trim().to_lowercase();
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(email)
        }
        _ => Err(EngineError::Invalid("email")),
    }
}

fn validate_optional_email(email: Option<String>) -> Result<Option<String>, EngineError> {
    email.map(|e| validate_email(&e)).transpose()
}

fn validate_text(text: Option<String>, max: usize, what: &'static str) -> Result<Option<String>, EngineError> {
    match text {
        Some(t) if t.len() > max => Err(EngineError::LimitExceeded(what)),
        other => Ok(other),
    }
}

fn validate_service_terms(duration_ms: Ms, price_cents: i64) -> Result<(), EngineError> {
    if duration_ms <= 0 {
        return Err(EngineError::Invalid("duration_ms"));
    }
    if duration_ms > MAX_SERVICE_DURATION_MS {
        return Err(EngineError::LimitExceeded("service too long"));
    }
    if price_cents < 0 {
        return Err(EngineError::Invalid("price_cents"));
    }
    Ok(())
}

impl Engine {
    fn email_taken(&self, email: &str, except: Option<Ulid>) -> bool {
        self.users
            .iter()
            .any(|u| u.email == email && Some(u.id) != except)
    }

    /// Booking → service/staff references must resolve.
    fn check_references(&self, service_id: Ulid, staff_id: Option<Ulid>) -> Result<(), EngineError> {
        if !self.services.contains_key(&service_id) {
            return Err(EngineError::NotFound(service_id));
        }
        if let Some(sid) = staff_id
            && !self.staff.contains_key(&sid) {
                return Err(EngineError::NotFound(sid));
            }
        Ok(())
    }

    fn reject_conflict(
        &self,
        book: &BookingBook,
        booking: &Booking,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        if !booking.status.occupies() {
            return Ok(());
        }
        match find_conflict(&book.schedule, &booking.span, exclude) {
            Some(other) => {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                debug!(
                    "booking {} [{}, {}) rejected: overlaps {other}",
                    booking.id, booking.span.start, booking.span.end
                );
                Err(EngineError::Conflict(other))
            }
            None => Ok(()),
        }
    }

    // ── Users ────────────────────────────────────────────────────

    pub async fn create_user(&self, new: NewUser) -> Result<User, EngineError> {
        let name = validate_name("name", &new.name)?;
        let email = validate_email(&new.email)?;

        let _catalog = self.catalog.lock().await;
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }
        if self.email_taken(&email, None) {
            return Err(EngineError::DuplicateEmail(email));
        }

        let user = User {
            id: new.id,
            email,
            name,
            role: new.role,
            created_at: now_ms(),
        };
        self.persist_catalog(&Event::UserCreated(user.clone())).await?;
        info!("user {} created ({})", user.id, user.role.as_str());
        Ok(user)
    }

    pub async fn update_user(&self, id: Ulid, patch: UserPatch) -> Result<User, EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut user = self
            .users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(id))?;

        if let Some(name) = patch.name {
            user.name = validate_name("name", &name)?;
        }
        if let Some(email) = patch.email {
            let email = validate_email(&email)?;
            if self.email_taken(&email, Some(id)) {
                return Err(EngineError::DuplicateEmail(email));
            }
            user.email = email;
        }
        if let Some(role) = patch.role {
            user.role = role;
        }

        self.persist_catalog(&Event::UserUpdated(user.clone())).await?;
        Ok(user)
    }

    pub async fn delete_user(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_catalog(&Event::UserDeleted { id }).await?;
        info!("user {id} deleted");
        Ok(())
    }

    // ── Services ─────────────────────────────────────────────────

    pub async fn create_service(&self, new: NewService) -> Result<Service, EngineError> {
        let name = validate_name("name", &new.name)?;
        validate_service_terms(new.duration_ms, new.price_cents)?;
        let description = validate_text(new.description, MAX_TEXT_LEN, "description too long")?;

        let _catalog = self.catalog.lock().await;
        if self.services.len() >= MAX_SERVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if self.services.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }

        let service = Service {
            id: new.id,
            name,
            description,
            duration_ms: new.duration_ms,
            price_cents: new.price_cents,
            created_at: now_ms(),
        };
        self.persist_catalog(&Event::ServiceCreated(service.clone())).await?;
        info!("service {} created", service.id);
        Ok(service)
    }

    pub async fn update_service(&self, id: Ulid, patch: ServicePatch) -> Result<Service, EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut service = self
            .services
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(id))?;

        if let Some(name) = patch.name {
            service.name = validate_name("name", &name)?;
        }
        if let Some(description) = patch.description {
            service.description = validate_text(description, MAX_TEXT_LEN, "description too long")?;
        }
        if let Some(d) = patch.duration_ms {
            service.duration_ms = d;
        }
        if let Some(p) = patch.price_cents {
            service.price_cents = p;
        }
        validate_service_terms(service.duration_ms, service.price_cents)?;

        self.persist_catalog(&Event::ServiceUpdated(service.clone())).await?;
        Ok(service)
    }

    /// Fails with `InUse` while any booking (cancelled ones included) points at it.
    pub async fn delete_service(&self, id: Ulid) -> Result<(), EngineError> {
        let book = self.bookings.write().await;
        let _catalog = self.catalog.lock().await;
        if !self.services.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if let Some(b) = book.rows.values().find(|b| b.service_id == id) {
            return Err(EngineError::InUse { id, booking: b.id });
        }
        self.persist_catalog(&Event::ServiceDeleted { id }).await?;
        info!("service {id} deleted");
        Ok(())
    }

    // ── Staff ────────────────────────────────────────────────────

    pub async fn create_staff(&self, new: NewStaff) -> Result<StaffMember, EngineError> {
        let name = validate_name("name", &new.name)?;
        let email = validate_optional_email(new.email)?;
        let phone = validate_text(new.phone, MAX_PHONE_LEN, "phone too long")?;

        let _catalog = self.catalog.lock().await;
        if self.staff.len() >= MAX_STAFF_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many staff"));
        }
        if self.staff.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }

        let member = StaffMember {
            id: new.id,
            name,
            email,
            phone,
            created_at: now_ms(),
        };
        self.persist_catalog(&Event::StaffCreated(member.clone())).await?;
        info!("staff {} created", member.id);
        Ok(member)
    }

    pub async fn update_staff(&self, id: Ulid, patch: StaffPatch) -> Result<StaffMember, EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut member = self
            .staff
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(id))?;

        if let Some(name) = patch.name {
            member.name = validate_name("name", &name)?;
        }
        if let Some(email) = patch.email {
            member.email = validate_optional_email(email)?;
        }
        if let Some(phone) = patch.phone {
            member.phone = validate_text(phone, MAX_PHONE_LEN, "phone too long")?;
        }

        self.persist_catalog(&Event::StaffUpdated(member.clone())).await?;
        Ok(member)
    }

    pub async fn delete_staff(&self, id: Ulid) -> Result<(), EngineError> {
        let book = self.bookings.write().await;
        let _catalog = self.catalog.lock().await;
        if !self.staff.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if let Some(b) = book.rows.values().find(|b| b.staff_id == Some(id)) {
            return Err(EngineError::InUse { id, booking: b.id });
        }
        self.persist_catalog(&Event::StaffDeleted { id }).await?;
        info!("staff {id} deleted");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────────

    fn build_booking(&self, draft: BookingDraft, created_at: Ms) -> Result<Booking, EngineError> {
        let span = validate_span(draft.start, draft.end)?;
        Ok(Booking {
            id: draft.id,
            service_id: draft.service_id,
            staff_id: draft.staff_id,
            customer_name: validate_name("customer_name", &draft.customer_name)?,
            customer_email: validate_optional_email(draft.customer_email)?,
            span,
            status: draft.status,
            notes: validate_text(draft.notes, MAX_TEXT_LEN, "notes too long")?,
            created_at,
        })
    }

    /// Check-then-insert under the booking write lock: two concurrent creates
    /// for overlapping ranges see each other, and the second gets `Conflict`.
    pub async fn create_booking(&self, draft: BookingDraft) -> Result<Booking, EngineError> {
        let booking = self.build_booking(draft, now_ms())?;

        let mut book = self.bookings.write().await;
        if book.rows.len() >= MAX_BOOKINGS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }
        if book.rows.contains_key(&booking.id) {
            return Err(EngineError::AlreadyExists(booking.id));
        }
        self.check_references(booking.service_id, booking.staff_id)?;
        self.reject_conflict(&book, &booking, None)?;

        self.persist_booking(&mut book, &Event::BookingCreated(booking.clone()))
            .await?;
        info!(
            "booking {} [{}, {}) {}",
            booking.id,
            booking.span.start,
            booking.span.end,
            booking.status.as_str()
        );
        Ok(booking)
    }

    /// Atomically create several bookings. All-or-nothing: if any draft is
    /// invalid or conflicts (with the store or with another draft), none are
    /// committed.
    pub async fn batch_create_bookings(
        &self,
        drafts: Vec<BookingDraft>,
    ) -> Result<Vec<Booking>, EngineError> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        if drafts.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let created_at = now_ms();
        let bookings = drafts
            .into_iter()
            .map(|d| self.build_booking(d, created_at))
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = HashSet::with_capacity(bookings.len());
        for b in &bookings {
            if !seen.insert(b.id) {
                return Err(EngineError::AlreadyExists(b.id));
            }
        }

        let mut book = self.bookings.write().await;
        if book.rows.len() + bookings.len() > MAX_BOOKINGS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }

        // Phase 1: validate everything against current state and each other.
        for b in &bookings {
            if book.rows.contains_key(&b.id) {
                return Err(EngineError::AlreadyExists(b.id));
            }
            self.check_references(b.service_id, b.staff_id)?;
            self.reject_conflict(&book, b, None)?;
        }
        let occupying: Vec<BookingInterval> = bookings
            .iter()
            .filter(|b| b.status.occupies())
            .map(Booking::interval)
            .collect();
        if let Some(id) = find_batch_conflict(&occupying) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(id));
        }

        // Phase 2: commit as a single WAL record, applied only once durable.
        self.persist_booking(&mut book, &Event::BookingsCreated(bookings.clone()))
            .await?;
        info!("batch of {} bookings committed", bookings.len());
        Ok(bookings)
    }

    /// Apply `patch` to a booking. The booking's own previous range is
    /// excluded from the conflict scan.
    pub async fn update_booking(&self, id: Ulid, patch: BookingPatch) -> Result<Booking, EngineError> {
        let mut book = self.bookings.write().await;
        let current = book
            .rows
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if patch.is_empty() {
            return Ok(current);
        }

        let draft = BookingDraft {
            id,
            service_id: patch.service_id.unwrap_or(current.service_id),
            staff_id: patch.staff_id.unwrap_or(current.staff_id),
            customer_name: patch.customer_name.unwrap_or(current.customer_name),
            customer_email: patch.customer_email.unwrap_or(current.customer_email),
            start: patch.start.unwrap_or(current.span.start),
            end: patch.end.unwrap_or(current.span.end),
            status: patch.status.unwrap_or(current.status),
            notes: patch.notes.unwrap_or(current.notes),
        };
        let updated = self.build_booking(draft, current.created_at)?;
        self.check_references(updated.service_id, updated.staff_id)?;
        self.reject_conflict(&book, &updated, Some(id))?;

        self.persist_booking(&mut book, &Event::BookingUpdated(updated.clone()))
            .await?;
        info!(
            "booking {} updated [{}, {}) {}",
            updated.id,
            updated.span.start,
            updated.span.end,
            updated.status.as_str()
        );
        Ok(updated)
    }

    pub async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let mut book = self.bookings.write().await;
        if !book.rows.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_booking(&mut book, &Event::BookingDeleted { id })
            .await?;
        info!("booking {id} deleted");
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    /// Holds the booking read lock and the catalog lock until the swap is done,
    /// so no write can land between the snapshot and the new file.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let book = self.bookings.read().await;
        let _catalog = self.catalog.lock().await;

        let mut events = Vec::with_capacity(
            self.users.len() + self.services.len() + self.staff.len() + book.rows.len(),
        );
        events.extend(select_rows(&self.users, None).into_iter().map(Event::UserCreated));
        events.extend(select_rows(&self.services, None).into_iter().map(Event::ServiceCreated));
        events.extend(select_rows(&self.staff, None).into_iter().map(Event::StaffCreated));
        let mut bookings: Vec<Booking> = book.rows.values().cloned().collect();
        bookings.sort_by_key(|b| b.id);
        events.extend(bookings.into_iter().map(Event::BookingCreated));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
