use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_products_table::Migration),
            Box::new(m20240101_000002_create_inventory_levels_table::Migration),
            Box::new(m20240101_000003_create_stock_movements_table::Migration),
            Box::new(m20240101_000004_create_sales_table::Migration),
            Box::new(m20240101_000005_create_sale_lines_table::Migration),
        ]
    }
}

// Migration implementations

mod m20240101_000001_create_products_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_products_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // Create products table aligned with entities::product Model
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Products::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::Sku)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(ColumnDef::new(Products::Description).string().null())
                        .col(ColumnDef::new(Products::Category).string().null())
                        .col(
                            ColumnDef::new(Products::UnitPrice)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::TaxRate)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Products::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(ColumnDef::new(Products::CreatedAt).timestamp().not_null())
                        .col(ColumnDef::new(Products::UpdatedAt).timestamp().null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_products_category")
                        .table(Products::Table)
                        .col(Products::Category)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
        Sku,
        Name,
        Description,
        Category,
        UnitPrice,
        TaxRate,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000002_create_inventory_levels_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000002_create_inventory_levels_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // Create inventory_levels table aligned with entities::inventory_level Model
            manager
                .create_table(
                    Table::create()
                        .table(InventoryLevels::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(InventoryLevels::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryLevels::ProductId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(InventoryLevels::VariantId).uuid().null())
                        .col(
                            ColumnDef::new(InventoryLevels::QuantityOnHand)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryLevels::QuantityAvailable)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryLevels::QuantityReserved)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryLevels::MinimumStockLevel)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryLevels::MaximumStockLevel)
                                .integer()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(InventoryLevels::ReorderPoint)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryLevels::ReorderQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryLevels::LastMovementAt)
                                .timestamp()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(InventoryLevels::CreatedAt)
                                .timestamp()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryLevels::UpdatedAt)
                                .timestamp()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_inventory_levels_product_id")
                                .from(InventoryLevels::Table, InventoryLevels::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_inventory_levels_product_variant")
                        .table(InventoryLevels::Table)
                        .col(InventoryLevels::ProductId)
                        .col(InventoryLevels::VariantId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_inventory_levels_reorder_point")
                        .table(InventoryLevels::Table)
                        .col(InventoryLevels::ReorderPoint)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(InventoryLevels::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum InventoryLevels {
        Table,
        Id,
        ProductId,
        VariantId,
        QuantityOnHand,
        QuantityAvailable,
        QuantityReserved,
        MinimumStockLevel,
        MaximumStockLevel,
        ReorderPoint,
        ReorderQuantity,
        LastMovementAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
    }
}

mod m20240101_000003_create_stock_movements_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000003_create_stock_movements_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // Create stock_movements table aligned with entities::stock_movement Model.
            // Rows are append-only; deleting a product with history is blocked.
            manager
                .create_table(
                    Table::create()
                        .table(StockMovements::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockMovements::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::ProductId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::VariantId).uuid().null())
                        .col(
                            ColumnDef::new(StockMovements::MovementType)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::Quantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::QuantityChange)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::QuantityBefore)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::QuantityAfter)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(StockMovements::ReferenceType)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::ReferenceId).uuid().null())
                        .col(
                            ColumnDef::new(StockMovements::MovementDate)
                                .timestamp()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::UserId).uuid().null())
                        .col(
                            ColumnDef::new(StockMovements::IsConfirmed)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(ColumnDef::new(StockMovements::Notes).string().null())
                        .col(
                            ColumnDef::new(StockMovements::CreatedAt)
                                .timestamp()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_movements_product_id")
                                .from(StockMovements::Table, StockMovements::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Restrict)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_movements_product_created")
                        .table(StockMovements::Table)
                        .col(StockMovements::ProductId)
                        .col(StockMovements::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_movements_reference")
                        .table(StockMovements::Table)
                        .col(StockMovements::ReferenceType)
                        .col(StockMovements::ReferenceId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StockMovements::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum StockMovements {
        Table,
        Id,
        ProductId,
        VariantId,
        MovementType,
        Quantity,
        QuantityChange,
        QuantityBefore,
        QuantityAfter,
        ReferenceType,
        ReferenceId,
        MovementDate,
        UserId,
        IsConfirmed,
        Notes,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
    }
}

mod m20240101_000004_create_sales_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000004_create_sales_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // Create sales table aligned with entities::sale Model
            manager
                .create_table(
                    Table::create()
                        .table(Sales::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Sales::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Sales::SaleNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Sales::ReceiptNumber).string().not_null())
                        .col(ColumnDef::new(Sales::Status).string().not_null())
                        .col(
                            ColumnDef::new(Sales::Subtotal)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Sales::TaxAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Sales::TotalAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Sales::PaymentMethod).string().not_null())
                        .col(ColumnDef::new(Sales::CustomerInfo).json().null())
                        .col(ColumnDef::new(Sales::CashierId).uuid().not_null())
                        .col(ColumnDef::new(Sales::VoidedAt).timestamp().null())
                        .col(ColumnDef::new(Sales::VoidedBy).uuid().null())
                        .col(ColumnDef::new(Sales::VoidReason).string().null())
                        .col(ColumnDef::new(Sales::Notes).string().null())
                        .col(ColumnDef::new(Sales::CreatedAt).timestamp().not_null())
                        .col(ColumnDef::new(Sales::UpdatedAt).timestamp().null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sales_status")
                        .table(Sales::Table)
                        .col(Sales::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sales_created_at")
                        .table(Sales::Table)
                        .col(Sales::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sales_cashier_id")
                        .table(Sales::Table)
                        .col(Sales::CashierId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Sales::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Sales {
        Table,
        Id,
        SaleNumber,
        ReceiptNumber,
        Status,
        Subtotal,
        TaxAmount,
        TotalAmount,
        PaymentMethod,
        CustomerInfo,
        CashierId,
        VoidedAt,
        VoidedBy,
        VoidReason,
        Notes,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000005_create_sale_lines_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000005_create_sale_lines_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // Create sale_lines table aligned with entities::sale_line Model
            manager
                .create_table(
                    Table::create()
                        .table(SaleLines::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SaleLines::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(SaleLines::SaleId).uuid().not_null())
                        .col(ColumnDef::new(SaleLines::LineNumber).integer().not_null())
                        .col(ColumnDef::new(SaleLines::ProductId).uuid().not_null())
                        .col(ColumnDef::new(SaleLines::Sku).string().not_null())
                        .col(ColumnDef::new(SaleLines::Name).string().not_null())
                        .col(ColumnDef::new(SaleLines::Category).string().null())
                        .col(ColumnDef::new(SaleLines::Quantity).integer().not_null())
                        .col(ColumnDef::new(SaleLines::UnitPrice).decimal().not_null())
                        .col(ColumnDef::new(SaleLines::LineTotal).decimal().not_null())
                        .col(
                            ColumnDef::new(SaleLines::TaxRate)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(SaleLines::TaxAmount)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(SaleLines::InventoryUpdated)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(SaleLines::InventoryUpdatedAt)
                                .timestamp()
                                .null(),
                        )
                        .col(ColumnDef::new(SaleLines::CreatedAt).timestamp().not_null())
                        .col(ColumnDef::new(SaleLines::UpdatedAt).timestamp().null())
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_sale_lines_sale_id")
                                .from(SaleLines::Table, SaleLines::SaleId)
                                .to(Sales::Table, Sales::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_sale_lines_product_id")
                                .from(SaleLines::Table, SaleLines::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Restrict)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sale_lines_sale_id")
                        .table(SaleLines::Table)
                        .col(SaleLines::SaleId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sale_lines_product_id")
                        .table(SaleLines::Table)
                        .col(SaleLines::ProductId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(SaleLines::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum SaleLines {
        Table,
        Id,
        SaleId,
        LineNumber,
        ProductId,
        Sku,
        Name,
        Category,
        Quantity,
        UnitPrice,
        LineTotal,
        TaxRate,
        TaxAmount,
        InventoryUpdated,
        InventoryUpdatedAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Sales {
        Table,
        Id,
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        Id,
    }
}
