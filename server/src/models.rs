use serde::{Deserialize, Serialize};

use crate::entities::result::{self, Prediction};
use crate::entities::user::{self, Role};
use crate::validation::{is_valid_email, max_chars, non_blank, normalize_email, FieldErrors};

// ─── Users ───

/// User fields safe to hand to any client
#[derive(Debug, Clone, Serialize)]
pub struct PublicUser {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub bio: Option<String>,
    pub avatar: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<user::Model> for PublicUser {
    fn from(u: user::Model) -> Self {
        Self {
            id: u.id,
            name: u.name,
            email: u.email,
            role: u.role,
            phone: u.phone,
            location: u.location,
            bio: u.bio,
            avatar: u.avatar,
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl From<&user::Model> for UserSummary {
    fn from(u: &user::Model) -> Self {
        Self {
            id: u.id,
            name: u.name.clone(),
            email: u.email.clone(),
            role: u.role,
        }
    }
}

// ─── Auth ───

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub password_confirmation: Option<String>,
}

/// Register input after validation
#[derive(Debug)]
pub struct NewAccount {
    pub name: String,
    pub email: String,
    pub password: String,
}

impl RegisterRequest {
    /// Shape checks only; email uniqueness needs the database.
    pub fn validate(self) -> Result<NewAccount, FieldErrors> {
        let mut errors = FieldErrors::new();

        let name = non_blank(self.name.as_deref()).map(str::to_string);
        match &name {
            None => errors.add("name", "The name field is required."),
            Some(n) => errors.check(max_chars(n, 255), "name", "The name may not be greater than 255 characters."),
        }

        let email = non_blank(self.email.as_deref()).map(normalize_email);
        match &email {
            None => errors.add("email", "The email field is required."),
            Some(e) => errors.check(is_valid_email(e), "email", "The email must be a valid email address."),
        }

        let password = self.password.unwrap_or_default();
        if password.is_empty() {
            errors.add("password", "The password field is required.");
        } else {
            errors.check(password.chars().count() >= 6, "password", "The password must be at least 6 characters.");
            errors.check(
                self.password_confirmation.as_deref() == Some(password.as_str()),
                "password",
                "The password confirmation does not match.",
            );
        }

        match (name, email) {
            (Some(name), Some(email)) if errors.is_empty() => Ok(NewAccount { name, email, password }),
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

impl LoginRequest {
    /// Returns the normalized email and the password.
    pub fn validate(self) -> Result<(String, String), FieldErrors> {
        let mut errors = FieldErrors::new();
        let email = non_blank(self.email.as_deref()).map(normalize_email);
        errors.check(email.is_some(), "email", "The email field is required.");
        let password = self.password.filter(|p| !p.is_empty());
        errors.check(password.is_some(), "password", "The password field is required.");
        match (email, password) {
            (Some(e), Some(p)) => Ok((e, p)),
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub message: &'static str,
    pub user: PublicUser,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

// ─── Media ───

#[derive(Debug, Serialize)]
pub struct StoredMedia {
    pub filename: String,
    pub path: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct SaveResultRequest {
    pub filename: Option<String>,
    pub prediction: Option<String>,
    pub confidence: Option<f64>,
    pub frames: Option<f64>,
    pub processing_time: Option<f64>,
    pub lime_image: Option<String>,
}

/// Analysis outcome after validation
#[derive(Debug, Clone)]
pub struct NewResult {
    pub filename: String,
    pub prediction: Prediction,
    pub confidence: f64,
    pub frames: i64,
    pub processing_time: f64,
    pub lime_image: Option<String>,
}

impl SaveResultRequest {
    pub fn validate(self) -> Result<NewResult, FieldErrors> {
        let mut errors = FieldErrors::new();

        let filename = non_blank(self.filename.as_deref()).map(str::to_string);
        errors.check(filename.is_some(), "filename", "The filename field is required.");

        let prediction = match non_blank(self.prediction.as_deref()) {
            None => {
                errors.add("prediction", "The prediction field is required.");
                None
            }
            Some(raw) => {
                let parsed = Prediction::parse(raw);
                errors.check(parsed.is_some(), "prediction", "The selected prediction is invalid.");
                parsed
            }
        };

        match self.confidence {
            None => errors.add("confidence", "The confidence field is required."),
            Some(c) => errors.check(
                c.is_finite() && (0.0..=1.0).contains(&c),
                "confidence",
                "The confidence must be between 0 and 1.",
            ),
        }

        match self.frames {
            None => errors.add("frames", "The frames field is required."),
            Some(f) => {
                errors.check(f.is_finite() && f.fract() == 0.0, "frames", "The frames must be an integer.");
                errors.check(f >= 1.0, "frames", "The frames must be at least 1.");
            }
        }

        match self.processing_time {
            None => errors.add("processing_time", "The processing time field is required."),
            Some(t) => errors.check(
                t.is_finite() && t >= 0.0,
                "processing_time",
                "The processing time must be at least 0.",
            ),
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        match (filename, prediction, self.confidence, self.frames, self.processing_time) {
            (Some(filename), Some(prediction), Some(confidence), Some(frames), Some(processing_time)) => {
                Ok(NewResult {
                    filename,
                    prediction,
                    confidence,
                    frames: frames as i64,
                    processing_time,
                    lime_image: self.lime_image.filter(|l| !l.trim().is_empty()),
                })
            }
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SavedResult {
    pub success: bool,
    pub result: result::Model,
    pub pdf_url: String,
}

#[derive(Debug, Serialize)]
pub struct DeletedResult {
    pub success: bool,
    pub message: &'static str,
}

// ─── Admin ───

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    pub search: Option<String>,
    pub page: Option<String>,
    pub per_page: Option<String>,
}

/// Parsed listing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct UserListing {
    pub search: Option<String>,
    pub page: u64,
    pub per_page: u64,
}

pub const DEFAULT_PER_PAGE: u64 = 15;
pub const MAX_PER_PAGE: u64 = 100;

impl ListUsersQuery {
    pub fn validate(self) -> Result<UserListing, FieldErrors> {
        let mut errors = FieldErrors::new();

        let per_page = match non_blank(self.per_page.as_deref()) {
            None => DEFAULT_PER_PAGE,
            Some(raw) => match raw.parse::<u64>() {
                Ok(n) if (1..=MAX_PER_PAGE).contains(&n) => n,
                _ => {
                    errors.add("per_page", "The per page must be an integer between 1 and 100.");
                    DEFAULT_PER_PAGE
                }
            },
        };

        let page = match non_blank(self.page.as_deref()) {
            None => 1,
            Some(raw) => match raw.parse::<u64>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    errors.add("page", "The page must be an integer of at least 1.");
                    1
                }
            },
        };

        let search = non_blank(self.search.as_deref()).map(str::to_string);
        if let Some(s) = &search {
            errors.check(max_chars(s, 255), "search", "The search may not be greater than 255 characters.");
        }

        if errors.is_empty() {
            Ok(UserListing { search, page, per_page })
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserWithCount {
    #[serde(flatten)]
    pub user: PublicUser,
    pub results_count: u64,
}

/// Page envelope for admin listings
#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub current_page: u64,
    pub data: Vec<T>,
    pub per_page: u64,
    pub total: u64,
    pub last_page: u64,
}

impl<T> Paginated<T> {
    pub fn new(data: Vec<T>, page: u64, per_page: u64, total: u64) -> Self {
        let last_page = total.div_ceil(per_page).max(1);
        Self {
            current_page: page,
            data,
            per_page,
            total,
            last_page,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AdminProfile {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub avatar: Option<String>,
    pub created_at: String,
}

impl From<&user::Model> for AdminProfile {
    fn from(u: &user::Model) -> Self {
        Self {
            id: u.id,
            name: u.name.clone(),
            email: u.email.clone(),
            role: u.role,
            avatar: u.avatar.clone(),
            created_at: u.created_at.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserStats {
    pub total_analysis: u64,
    pub last_analysis: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserDetail {
    #[serde(flatten)]
    pub profile: AdminProfile,
    pub stats: UserStats,
}

#[derive(Debug, Serialize)]
pub struct UserDetailResponse {
    pub user: UserDetail,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub role: Option<String>,
}

impl UpdateRoleRequest {
    pub fn validate(self) -> Result<Role, FieldErrors> {
        let mut errors = FieldErrors::new();
        match self.role.as_deref().map(str::trim) {
            None | Some("") => errors.add("role", "The role field is required."),
            Some(raw) => match Role::parse(raw) {
                Some(role) => return Ok(role),
                None => errors.add("role", "The selected role is invalid."),
            },
        }
        Err(errors)
    }
}

#[derive(Debug, Serialize)]
pub struct RoleUpdated {
    pub message: &'static str,
    pub user: UserSummary,
}

/// Fixed projection of a result for admin history views
#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub filename: String,
    pub prediction: Prediction,
    pub confidence: f64,
    pub frames: i64,
    pub processing_time: f64,
    pub created_at: String,
    pub pdf_path: Option<String>,
}

impl From<result::Model> for HistoryEntry {
    fn from(r: result::Model) -> Self {
        Self {
            id: r.id,
            filename: r.filename,
            prediction: r.prediction,
            confidence: r.confidence,
            frames: r.frames,
            processing_time: r.processing_time,
            created_at: r.created_at,
            pdf_path: r.pdf_path,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserHistory {
    pub user: UserSummary,
    pub history: Vec<HistoryEntry>,
}
