//! Image entity

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "images")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub product_id: String,
    pub stream_id: String,
    pub name: String,
    pub source: String,       // "mirrored" | "custom"
    pub status: String,       // pending/mirroring/uploading/ready/error
    pub status_detail: Option<String>,
    pub origin_index_url: Option<String>,
    pub os: Option<String>,
    pub release: Option<String>,
    pub release_title: Option<String>,
    pub release_codename: Option<String>,
    pub version: Option<String>,
    pub arch: Option<String>,
    pub subarch: Option<String>,
    pub subarches: Option<String>,
    pub label: Option<String>,
    pub kflavor: Option<String>,
    pub krel: Option<String>,
    pub build_id: Option<String>,
    pub product_meta: Option<String>, // JSON object, upstream product fields
    pub version_meta: Option<String>, // JSON object, version fields besides items
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::artifact::Entity")]
    Artifacts,
}

impl Related<super::artifact::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Artifacts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
