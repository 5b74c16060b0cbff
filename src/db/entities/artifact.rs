//! Artifact entity (files owned by an image)

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "artifacts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub image_id: i32,
    pub name: String,          // simplestream item name
    pub kind: String,          // kernel/initrd/rootfs/manifest/other
    pub ftype: String,
    pub relative_path: String, // relative to the artifact root
    pub size: i64,
    pub sha256: String,        // 64-char hex
    pub source_url: Option<String>,
    pub item_meta: Option<String>,     // JSON object, extra upstream item keys
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::image::Entity",
        from = "Column::ImageId",
        to = "super::image::Column::Id"
    )]
    Image,
}

impl Related<super::image::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Image.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
