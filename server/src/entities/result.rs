use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Verdict of one analysis. Stored and serialized uppercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "UPPERCASE")]
pub enum Prediction {
    #[sea_orm(string_value = "REAL")]
    Real,
    #[sea_orm(string_value = "FAKE")]
    Fake,
}

impl Prediction {
    /// Case-insensitive at ingress: "fake", "Fake " and "FAKE" all parse.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "REAL" => Some(Prediction::Real),
            "FAKE" => Some(Prediction::Fake),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Prediction::Real => "REAL",
            Prediction::Fake => "FAKE",
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "results")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub filename: String,
    pub prediction: Prediction,
    pub confidence: f64,
    pub frames: i64,
    pub processing_time: f64,
    pub pdf_path: Option<String>,
    pub lime_image: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id",
        on_delete = "Cascade"
    )]
    User,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
