use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use ndarray::Axis;
use ply_rs::ply::{
    Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
    ScalarType,
};
use ply_rs::writer::Writer;
use tracing::info;

use super::Geometry;
use crate::error::{Error, Result};
use crate::mesh::TriangleMesh;
use crate::pointcloud::PointCloud;

/// Writes a geometry as an ASCII PLY file.
pub fn write_ply<P>(filepath: P, geom: &Geometry) -> Result<()>
where
    P: AsRef<Path>,
{
    let mut ply = Ply::<DefaultElement>::new();
    let mut vertex_element = ElementDef::new("vertex".to_string());
    ["x", "y", "z"].iter().for_each(|key| {
        vertex_element.properties.add(PropertyDef::new(
            key.to_string(),
            PropertyType::Scalar(ScalarType::Float),
        ));
    });

    let mut vertex_array: Vec<DefaultElement> = geom
        .points
        .axis_iter(Axis(0))
        .map(|point| {
            let mut elem = DefaultElement::new();
            elem.insert("x".to_string(), Property::Float(point[0]));
            elem.insert("y".to_string(), Property::Float(point[1]));
            elem.insert("z".to_string(), Property::Float(point[2]));
            elem
        })
        .collect();

    if let Some(normals) = &geom.normals {
        ["nx", "ny", "nz"].iter().for_each(|key| {
            vertex_element.properties.add(PropertyDef::new(
                key.to_string(),
                PropertyType::Scalar(ScalarType::Float),
            ));
        });

        for (elem, normal) in vertex_array.iter_mut().zip(normals.axis_iter(Axis(0))) {
            elem.insert("nx".to_string(), Property::Float(normal[0]));
            elem.insert("ny".to_string(), Property::Float(normal[1]));
            elem.insert("nz".to_string(), Property::Float(normal[2]));
        }
    }

    if let Some(colors) = &geom.colors {
        ["red", "green", "blue"].iter().for_each(|key| {
            vertex_element.properties.add(PropertyDef::new(
                key.to_string(),
                PropertyType::Scalar(ScalarType::UChar),
            ));
        });

        for (elem, color) in vertex_array.iter_mut().zip(colors.axis_iter(Axis(0))) {
            elem.insert("red".to_string(), Property::UChar(color[0]));
            elem.insert("green".to_string(), Property::UChar(color[1]));
            elem.insert("blue".to_string(), Property::UChar(color[2]));
        }
    }

    ply.header.elements.add(vertex_element);
    ply.payload.insert("vertex".to_string(), vertex_array);

    if let Some(faces) = &geom.faces {
        let mut face_element = ElementDef::new("face".to_string());
        face_element.properties.add(PropertyDef::new(
            "vertex_indices".to_string(),
            PropertyType::List(ScalarType::UChar, ScalarType::Int),
        ));
        let face_array: Vec<DefaultElement> = faces
            .axis_iter(Axis(0))
            .map(|face| {
                let mut elem = DefaultElement::new();
                elem.insert(
                    "vertex_indices".to_string(),
                    Property::ListInt(face.iter().map(|f| *f as i32).collect()),
                );
                elem
            })
            .collect();

        ply.header.elements.add(face_element);
        ply.payload.insert("face".to_string(), face_array);
    }

    ply.make_consistent()
        .map_err(|err| Error::format(format!("inconsistent PLY: {err:?}")))?;
    ply.header.encoding = Encoding::Ascii;

    let mut buf = BufWriter::new(File::create(filepath)?);
    Writer::new().write_ply(&mut buf, &mut ply)?;
    Ok(())
}

/// Saves a mesh with its normals and vertex colors.
pub fn write_mesh_ply<P: AsRef<Path>>(filepath: P, mesh: &TriangleMesh) -> Result<()> {
    write_ply(filepath.as_ref(), &Geometry::from(mesh.clone()))?;
    info!(
        path = %filepath.as_ref().display(),
        faces = mesh.len_faces(),
        "saved mesh"
    );
    Ok(())
}

/// Saves a point cloud with whatever normals and colors it carries.
pub fn write_point_cloud_ply<P: AsRef<Path>>(filepath: P, cloud: &PointCloud) -> Result<()> {
    write_ply(filepath.as_ref(), &Geometry::from(cloud.clone()))?;
    info!(
        path = %filepath.as_ref().display(),
        points = cloud.len(),
        "saved point cloud"
    );
    Ok(())
}
