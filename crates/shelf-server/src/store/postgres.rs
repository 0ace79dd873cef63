//! PostgreSQL product store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use shelf_proto::{Product, ProductId};

use super::ProductStore;
use crate::error::Error;

const MAX_CONNECTIONS: u32 = 4;
const MAX_LIFETIME: Duration = Duration::from_secs(60);

const PRODUCT_COLUMNS: &str = r#"
    ProductID AS product_id,
    Manufacturer AS manufacturer,
    PricePerUnit AS price_per_unit,
    UnitsAvailable AS units_available,
    ProductName AS product_name
"#;

/// Product store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgProductStore {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgProductStore {
    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str, query_timeout: Duration) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .max_lifetime(MAX_LIFETIME)
            .connect(database_url)
            .await?;

        info!(max_connections = MAX_CONNECTIONS, "connected to PostgreSQL");
        Ok(Self::from_pool(pool, query_timeout))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    /// Create the products table, id sequence and change trigger, emptying
    /// the table. The trigger publishes every row change on `channel`.
    ///
    /// `channel` is interpolated into SQL and must be a plain identifier.
    pub async fn init_schema(&self, channel: &str) -> Result<(), Error> {
        if !postgres_identifier(channel) {
            return Err(Error::Config(format!("invalid channel name: {channel:?}")));
        }

        let statements = [
            r#"CREATE TABLE IF NOT EXISTS Products (
                ProductID BIGINT PRIMARY KEY,
                Manufacturer VARCHAR(100) NOT NULL,
                PricePerUnit VARCHAR(100) NOT NULL,
                UnitsAvailable INTEGER NOT NULL,
                ProductName VARCHAR(100) NOT NULL
            )"#
            .to_string(),
            "DELETE FROM Products".to_string(),
            "CREATE SEQUENCE IF NOT EXISTS pk_product CACHE 100 OWNED BY Products.ProductID"
                .to_string(),
            format!(
                r#"CREATE OR REPLACE FUNCTION notify_product_change() RETURNS trigger AS $$
                DECLARE
                    changed RECORD;
                BEGIN
                    IF TG_OP = 'DELETE' THEN
                        changed := OLD;
                    ELSE
                        changed := NEW;
                    END IF;
                    PERFORM pg_notify('{channel}', json_build_object(
                        'action', lower(TG_OP),
                        'product', json_build_object(
                            'productId', changed.ProductID,
                            'manufacturer', changed.Manufacturer,
                            'pricePerUnit', changed.PricePerUnit,
                            'unitsAvailable', changed.UnitsAvailable,
                            'productName', changed.ProductName
                        )
                    )::text);
                    RETURN changed;
                END;
                $$ LANGUAGE plpgsql"#
            ),
            "DROP TRIGGER IF EXISTS product_change ON Products".to_string(),
            r#"CREATE TRIGGER product_change
                AFTER INSERT OR UPDATE OR DELETE ON Products
                FOR EACH ROW EXECUTE FUNCTION notify_product_change()"#
                .to_string(),
        ];

        for statement in &statements {
            self.timed(sqlx::query(statement).execute(&self.pool))
                .await?;
        }

        info!(channel, "product schema initialized");
        Ok(())
    }

    async fn timed<T, F>(&self, query: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.query_timeout, query).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout(self.query_timeout)),
        }
    }
}

/// Whether `name` is safe to use unquoted as a PostgreSQL identifier.
pub(crate) fn postgres_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn product_from_row(row: &PgRow) -> Result<Product, sqlx::Error> {
    Ok(Product {
        product_id: row.try_get("product_id")?,
        manufacturer: row.try_get("manufacturer")?,
        price_per_unit: row.try_get("price_per_unit")?,
        units_available: row.try_get("units_available")?,
        product_name: row.try_get("product_name")?,
    })
}

#[async_trait]
impl ProductStore for PgProductStore {
    async fn all(&self) -> Result<Vec<Product>, Error> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM Products ORDER BY ProductID");
        let rows = self.timed(sqlx::query(&sql).fetch_all(&self.pool)).await?;

        let products = rows
            .iter()
            .map(product_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = products.len(), "loaded products");
        Ok(products)
    }

    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, Error> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM Products WHERE ProductID = $1");
        let row = self
            .timed(sqlx::query(&sql).bind(id).fetch_optional(&self.pool))
            .await?;

        Ok(row.as_ref().map(product_from_row).transpose()?)
    }

    async fn create(&self, product: Product) -> Result<Product, Error> {
        let row = self
            .timed(
                sqlx::query(
                    r#"INSERT INTO Products (ProductID, Manufacturer, PricePerUnit, UnitsAvailable, ProductName)
                    VALUES (nextval('pk_product'), $1, $2, $3, $4)
                    RETURNING ProductID"#,
                )
                .bind(&product.manufacturer)
                .bind(&product.price_per_unit)
                .bind(product.units_available)
                .bind(&product.product_name)
                .fetch_one(&self.pool),
            )
            .await?;

        let id: ProductId = row.try_get(0)?;
        Ok(product.with_id(id))
    }

    async fn update_by_id(&self, id: ProductId, product: Product) -> Result<bool, Error> {
        let result = self
            .timed(
                sqlx::query(
                    r#"UPDATE Products SET
                        Manufacturer = $1,
                        PricePerUnit = $2,
                        UnitsAvailable = $3,
                        ProductName = $4
                    WHERE ProductID = $5"#,
                )
                .bind(&product.manufacturer)
                .bind(&product.price_per_unit)
                .bind(product.units_available)
                .bind(&product.product_name)
                .bind(id)
                .execute(&self.pool),
            )
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_id(&self, id: ProductId) -> Result<bool, Error> {
        let result = self
            .timed(
                sqlx::query("DELETE FROM Products WHERE ProductID = $1")
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
